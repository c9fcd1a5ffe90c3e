//! primjit: runtime-generated tensor-compute microkernels.
//!
//! This crate synthesizes, at process run time, x86-64 AVX2 machine code
//! specialized for one matrix-multiply or direct-convolution configuration,
//! instead of shipping one generic pre-compiled routine. A configuration is
//! bound once; the generated kernel is then invoked arbitrarily many times
//! with runtime data pointers and extents, from any number of threads.
//!
//! - **Specialization**: tile sizes, beta semantics, offset correction and
//!   padding handling are resolved at generation time — no hot-loop flag
//!   branching.
//! - **Batched reduction**: a kernel reduces a list of operand-tile pairs
//!   into one destination tile with a single final store, so blocked-format
//!   contractions never round-trip partials through memory.
//! - **One kernel per config**: a process-scoped registry de-duplicates
//!   concurrent binds; kernels are immutable and freely shareable.
//!
//! # Quick start
//!
//! ```ignore
//! use primjit::{GemmArgs, GemmConfig, KernelDescriptor, TilePair};
//!
//! let desc = KernelDescriptor::bind(GemmConfig::default())?;
//! let pair = TilePair { a: a_ptr, b: b_ptr };
//! unsafe { desc.invoke_gemm(&GemmArgs { batch: &pair, batch_len: 1, /* .. */ }) };
//! ```

pub mod codegen;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod executable;
pub mod kernel;
pub mod memory;
pub mod microarch;
pub mod regalloc;
pub mod validation;

pub use config::{ConvConfig, DataType, GemmConfig, KernelConfig, SrcLayout};
pub use descriptor::{clear_registry, registry_len, KernelDescriptor};
pub use error::{Error, Result};
pub use executable::live_buffer_count;
pub use kernel::{ConvArgs, GemmArgs, GeneratedKernel, TilePair};
pub use memory::{HostStorage, MemoryStorage};
pub use regalloc::{ConvRegisterPlan, RegisterPlan};
