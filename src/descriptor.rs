//! Kernel descriptors and the process-scoped config -> kernel registry.
//!
//! `bind` is generate-or-fetch under one lock: concurrent binds of the same
//! configuration serialize, so at most one kernel is ever produced per
//! distinct config. The registry holds weak references — a kernel lives
//! exactly as long as some descriptor does, and dropping the last
//! descriptor releases its executable memory. `clear_registry` is the
//! explicit teardown for the map itself. Failed binds are never cached.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, Weak};

use tracing::debug;

use crate::codegen::{conv, gemm};
use crate::config::KernelConfig;
use crate::error::{Error, Result};
use crate::executable::CodeBuffer;
use crate::kernel::{ConvArgs, GemmArgs, GeneratedKernel, TilePair};
use crate::microarch::has_required_isa;

type Registry = Mutex<HashMap<KernelConfig, Weak<GeneratedKernel>>>;

static REGISTRY: OnceLock<Registry> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Drop every registry entry. Kernels still referenced by live descriptors
/// stay alive; everything else was weak already.
pub fn clear_registry() {
    registry().lock().unwrap().clear();
}

/// Number of (possibly dead) registry entries; for tests.
pub fn registry_len() -> usize {
    registry().lock().unwrap().len()
}

/// One bound configuration: a config paired with its generated kernel.
///
/// Descriptors are cheap handles; binding the same config again yields a
/// descriptor sharing the already-generated kernel.
pub struct KernelDescriptor {
    kernel: Arc<GeneratedKernel>,
}

impl KernelDescriptor {
    /// Generate-or-fetch the kernel for `config`.
    pub fn bind(config: impl Into<KernelConfig>) -> Result<Self> {
        let config = config.into();
        config.validate()?;
        if !has_required_isa() {
            return Err(Error::UnsupportedIsa("avx2+fma"));
        }

        let mut map = registry().lock().unwrap();
        if let Some(weak) = map.get(&config) {
            if let Some(kernel) = weak.upgrade() {
                debug!(?config, "kernel registry hit");
                return Ok(KernelDescriptor { kernel });
            }
        }
        // Drop entries whose descriptors are all gone before growing.
        map.retain(|_, w| w.strong_count() > 0);

        let code = match &config {
            KernelConfig::Gemm(c) => gemm::generate(c)?,
            KernelConfig::Conv(c) => conv::generate(c)?,
        };
        let buffer = CodeBuffer::new(&code)?;
        debug!(?config, code_bytes = code.len(), "kernel generated");
        let kernel = Arc::new(GeneratedKernel::new(config, buffer));
        map.insert(config, Arc::downgrade(&kernel));
        Ok(KernelDescriptor { kernel })
    }

    pub fn config(&self) -> &KernelConfig {
        self.kernel.config()
    }

    pub fn kernel(&self) -> &GeneratedKernel {
        &self.kernel
    }

    /// Shared handle to the underlying kernel. The registry itself holds
    /// only a weak reference, so the kernel lives exactly as long as some
    /// descriptor or clone of this handle does.
    pub fn shared_kernel(&self) -> Arc<GeneratedKernel> {
        Arc::clone(&self.kernel)
    }

    /// Single GEMM invocation; `args.batch`/`batch_len` describe one or
    /// more pairs the caller laid out itself.
    ///
    /// # Safety
    /// See [`GeneratedKernel::invoke_gemm`].
    pub unsafe fn invoke_gemm(&self, args: &GemmArgs) {
        self.kernel.invoke_gemm(args);
    }

    /// Batched GEMM: reduce every pair into the destination tile of
    /// `args`, with a single final store. An empty list is a store-through
    /// of the existing destination under the bound beta semantics.
    ///
    /// # Safety
    /// See [`GeneratedKernel::invoke_gemm`]; additionally every pair must
    /// be valid for the extents in `args`.
    pub unsafe fn invoke_gemm_batch(&self, pairs: &[TilePair], args: &GemmArgs) {
        let args = GemmArgs {
            batch: pairs.as_ptr(),
            batch_len: pairs.len(),
            ..*args
        };
        self.kernel.invoke_gemm(&args);
    }

    /// Single convolution-row invocation.
    ///
    /// # Safety
    /// See [`GeneratedKernel::invoke_conv`].
    pub unsafe fn invoke_conv(&self, args: &ConvArgs) {
        self.kernel.invoke_conv(args);
    }

    /// Batched convolution row: accumulate every (src, weights) pair into
    /// the same output row.
    ///
    /// # Safety
    /// See [`GeneratedKernel::invoke_conv`].
    pub unsafe fn invoke_conv_batch(&self, pairs: &[TilePair], args: &ConvArgs) {
        let args = ConvArgs {
            batch: pairs.as_ptr(),
            batch_len: pairs.len(),
            ..*args
        };
        self.kernel.invoke_conv(&args);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DataType, GemmConfig};

    #[test]
    fn bind_rejects_invalid_configs_without_caching() {
        let bad = GemmConfig {
            a_type: DataType::S8,
            ..GemmConfig::default()
        };
        let before = registry_len();
        assert!(KernelDescriptor::bind(bad).is_err());
        assert!(registry_len() <= before + 1); // nothing new cached
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn rebind_shares_the_generated_kernel() {
        if !has_required_isa() {
            eprintln!("skipping: host lacks AVX2/FMA");
            return;
        }
        let cfg = GemmConfig {
            unroll_m: 8,
            unroll_n: 5,
            ..GemmConfig::default()
        };
        let d1 = KernelDescriptor::bind(cfg).unwrap();
        let d2 = KernelDescriptor::bind(cfg).unwrap();
        assert!(Arc::ptr_eq(&d1.kernel, &d2.kernel));
    }
}
