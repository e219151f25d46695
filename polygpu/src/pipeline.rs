//! GPU Mapping Pipeline
//!
//! Turns every kernel region of a polyhedral program into a GPU kernel:
//!
//! ```text
//! Scop region -> kernel schedule -> reference groups -> placement -> body -> AST
//!                 (tile + map)       (overlap merge)    (shared/    (copies,
//!                                                        private)    barriers)
//! ```
//!
//! # Pipeline Stages
//!
//! ## Stage 1: Kernel Schedule
//! - **Input**: Program + region + [`GpuOptions`]
//! - **Output**: Tiled schedule with block and thread ids as parameters
//!
//! ## Stage 2: Reference Grouping
//! - **Input**: Kernel schedule + references of the region
//! - **Output**: Groups with shared and private tiles
//!
//! ## Stage 3: Placement
//! - **Input**: Groups
//! - **Output**: Groups restricted to unrollable private tiles and to the
//!   shared memory budget
//!
//! ## Stage 4: Body Schedule
//! - **Input**: Placed groups
//! - **Output**: Statements, copies and barriers in execution order, point
//!   loops of private tiles moved innermost
//!
//! ## Stage 5: Assembly
//! - **Input**: Body schedule + [`AstBuilder`]
//! - **Output**: [`Kernel`]
//!
//! # Usage
//! ```
//! use polygpu::config::GpuOptions;
//! use polygpu::pipeline::GpuPipeline;
//! use polygpu::scop::ScopBuilder;
//!
//! let mut b = ScopBuilder::new();
//! b.param("N");
//! b.context("N >= 1")?;
//! b.array("A", "float", 4, 1);
//! let s = b.statement("S", &["i"], "0 <= i < N", &["i"])?;
//! b.write(s, "A", &["i"])?;
//! b.region(&[s], 0, 1);
//! let scop = b.build()?;
//!
//! let mut pipeline = GpuPipeline::new(GpuOptions::default());
//! let program = pipeline.compile(&scop)?;
//! assert_eq!(program.kernels.len(), 1);
//! # Ok::<(), polygpu::error::GpuError>(())
//! ```

use log::{debug, error, info};
use serde::Serialize;

use crate::analysis::KernelContext;
use crate::ast::{build_host, AstBuilder, AstNode, TreeBuilder};
use crate::config::GpuOptions;
use crate::error::Result;
use crate::group::group_references;
use crate::kernel::{assemble, Kernel};
use crate::placement::{check_unroll, enforce_shared_budget};
use crate::schedule::KernelSchedule;
use crate::scop::{KernelRegion, Scop};
use crate::sync::{interchange_for_unroll, schedule_body};

// ============================================================================
// Results
// ============================================================================

/// Kernels of a program and the host code launching them
#[derive(Debug, Clone, Serialize)]
pub struct CompiledProgram {
    pub kernels: Vec<Kernel>,
    pub host: AstNode,
}

impl CompiledProgram {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

// ============================================================================
// Driver
// ============================================================================

pub struct GpuPipeline {
    options: GpuOptions,
    builder: Box<dyn AstBuilder>,
}

impl GpuPipeline {
    /// Pipeline generating ASTs with [`TreeBuilder`]
    pub fn new(options: GpuOptions) -> Self {
        Self::with_builder(options, Box::new(TreeBuilder))
    }

    pub fn with_builder(options: GpuOptions, builder: Box<dyn AstBuilder>) -> Self {
        Self { options, builder }
    }

    pub fn options(&self) -> &GpuOptions {
        &self.options
    }

    /// Compiles every kernel region of `scop`.
    ///
    /// # Errors
    /// Invalid options or programs, algebra engine failures and arrays that
    /// must live in private memory but cannot. The first failing kernel
    /// aborts the whole program.
    pub fn compile(&mut self, scop: &Scop) -> Result<CompiledProgram> {
        self.options.validate()?;
        scop.validate()?;
        let mut scop = scop.clone();
        scop.recompute_flags();
        scop.recompute_extents()?;
        info!(
            "compiling {} kernel region(s) over {} statement(s)",
            scop.regions.len(),
            scop.statements.len()
        );

        let mut kernels = Vec::with_capacity(scop.regions.len());
        for (id, region) in scop.regions.iter().enumerate() {
            match self.compile_kernel(id, &scop, region) {
                Ok(kernel) => kernels.push(kernel),
                Err(e) => {
                    error!("kernel {} failed: {}", id, e);
                    return Err(e);
                }
            }
        }

        let launches: Vec<(usize, &KernelSchedule)> =
            kernels.iter().map(|k| (k.id, &k.schedule)).collect();
        let host = build_host(&launches);
        Ok(CompiledProgram { kernels, host })
    }

    /// Compiles one region of an already validated program.
    pub fn compile_kernel(&mut self, id: usize, scop: &Scop, region: &KernelRegion) -> Result<Kernel> {
        let schedule = KernelSchedule::build(scop, region, &self.options)?;
        debug!(
            "kernel {}: depth {}, shared prefix {}, private prefix {}",
            id,
            schedule.depth(),
            schedule.shared_len(),
            schedule.private_len()
        );
        let ctx = KernelContext::new(scop, &self.options, schedule);

        let mut groups = group_references(&ctx)?;
        let unroll = check_unroll(&ctx, &mut groups)?;
        enforce_shared_budget(&ctx, &mut groups)?;
        for group in &groups {
            debug!(
                "kernel {}: {} group {} {:?} -> {:?}",
                id,
                group.array,
                group.nr,
                group.refs,
                group.placement()
            );
        }

        let mut body = schedule_body(&ctx, &groups)?;
        interchange_for_unroll(&mut body, &unroll);
        assemble(id, &ctx, groups, body, self.builder.as_mut())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GpuError;
    use crate::scop::ScopBuilder;

    fn two_kernels() -> Scop {
        // for i: A[i] = 0;  for t: for i: B[i] = A[i]
        let mut b = ScopBuilder::new();
        b.param("N");
        b.param("M");
        b.context("N >= 1 and M >= 1").unwrap();
        b.array("A", "float", 4, 1);
        b.array("B", "float", 4, 1);
        let s0 = b.statement("S0", &["i"], "0 <= i < N", &["0", "i", "0"]).unwrap();
        b.write(s0, "A", &["i"]).unwrap();
        let s1 = b
            .statement("S1", &["t", "i"], "0 <= t < M and 0 <= i < N", &["1", "t", "i"])
            .unwrap();
        b.read(s1, "A", &["i"]).unwrap();
        b.write(s1, "B", &["i"]).unwrap();
        b.region(&[s0], 1, 1);
        b.region(&[s1], 2, 1);
        b.build().unwrap()
    }

    #[test]
    fn test_compile_program() {
        let scop = two_kernels();
        let mut pipeline = GpuPipeline::new(GpuOptions::default());
        let program = pipeline.compile(&scop).unwrap();
        assert_eq!(program.kernels.len(), 2);
        assert_eq!(program.kernels[0].id, 0);
        assert_eq!(program.kernels[1].id, 1);

        // the second launch sits in the host loop over t
        let path = program
            .host
            .enclosing(&|n| matches!(n, AstNode::Launch { kernel: 1 }))
            .unwrap();
        assert_eq!(path.len(), 1);
        assert_eq!(path[0].level, 1);

        let json = program.to_json().unwrap();
        assert!(json.contains("\"kernels\""));
    }

    #[test]
    fn test_invalid_options_rejected() {
        let scop = two_kernels();
        let options = GpuOptions {
            block_sizes: Vec::new(),
            ..GpuOptions::default()
        };
        let mut pipeline = GpuPipeline::new(options);
        let err = pipeline.compile(&scop).unwrap_err();
        assert!(matches!(err, GpuError::InvalidOptions(_)));
    }
}
