//! PolyGPU: Polyhedral Memory-Hierarchy Mapping for GPU Kernels
//!
//! This library maps the kernel regions of a polyhedral program onto a GPU:
//! 1. Tile the outermost permutable band and map it to blocks and threads
//! 2. Group array references and place each group in shared memory, private
//!    registers or global memory
//! 3. Order statements, copies and barriers in the kernel body
//! 4. Build the kernel and host ASTs
//!
//! # Core Pipeline Flow
//! ```text
//! Scop → KernelSchedule → ReferenceGroups → Placement → BodySchedule → Kernel
//!           ↓                  ↓                ↓             ↓
//!     block/thread ids    tiles + strides   budget +      copies +
//!                                           unrolling     barriers
//! ```
//!
//! # Module Organization
//!
//! ## Polyhedral Core
//! - [`poly`]: Affine expressions, constraint systems and the integer engine
//! - [`relation`]: Access relations at a given schedule depth
//! - [`bound`]: Stride detection and tile bound inference
//!
//! ## Program Model
//! - [`scop`]: Statements, arrays, references and kernel regions
//! - [`config`]: Mapping options
//!
//! ## Mapping Stages
//! - [`schedule`]: Tiling and block/thread mapping of a region
//! - [`analysis`]: Per-kernel context and access predicates
//! - [`group`]: Reference grouping
//! - [`tile`]: Tiles, tiling maps and local variable names
//! - [`placement`]: Shared/private placement, budget and unroll checks
//! - [`sync`]: Copies, barriers and unroll interchange
//! - [`ast`]: Kernel and host ASTs
//! - [`kernel`]: Kernel assembly
//! - [`pipeline`]: End-to-end driver

pub mod analysis;
pub mod ast;
pub mod bound;
pub mod config;
pub mod error;
pub mod group;
pub mod kernel;
pub mod pipeline;
pub mod placement;
pub mod poly;
pub mod relation;
pub mod schedule;
pub mod scop;
pub mod sync;
pub mod tile;

pub use config::{GpuOptions, Mapping};
pub use error::{EngineError, GpuError, ParseError, Result};
pub use kernel::Kernel;
pub use pipeline::{CompiledProgram, GpuPipeline};
pub use scop::{Scop, ScopBuilder};
