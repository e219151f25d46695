//! Kernel assembly
//!
//! Collects everything known about one kernel into a serializable
//! [`Kernel`]: launch sizes, block and thread identifiers, the arrays it
//! touches with bounds restricted to its accesses, local variables, groups
//! with their tiling maps, the final schedule and the AST.

use log::info;
use serde::Serialize;

use crate::analysis::KernelContext;
use crate::ast::{AstBuilder, AstNode};
use crate::bound::{infer_extent, DimExtent};
use crate::error::Result;
use crate::group::ReferenceGroup;
use crate::poly::AffConstraint;
use crate::schedule::KernelSchedule;
use crate::sync::{BodySchedule, ScheduleItem};
use crate::tile::{local_name, Placement, TilingMap};

/// Array accessed by a kernel
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocalizedArray {
    pub name: String,
    pub element_type: String,
    pub element_size: usize,
    /// Index range accessed by the kernel, over the program parameters
    pub extent: Vec<DimExtent>,
    pub read_only: bool,
}

/// Shared or private copy of a reference group
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocalVariable {
    pub name: String,
    pub array: String,
    pub placement: Placement,
    pub sizes: Vec<i64>,
    pub element_count: i64,
    pub bytes: i64,
    pub tiling: TilingMap,
}

#[derive(Debug, Clone, Serialize)]
pub struct Kernel {
    pub id: usize,
    /// Program parameters followed by block and thread ids
    pub param_names: Vec<String>,
    /// Constraints on the program parameters and ids
    pub context: Vec<AffConstraint>,
    /// Grid size, innermost dimension (`x`) first
    pub grid_size: Vec<i64>,
    /// Block size, innermost dimension (`x`) first
    pub block_size: Vec<i64>,
    pub block_ids: Vec<String>,
    pub thread_ids: Vec<String>,
    pub arrays: Vec<LocalizedArray>,
    pub variables: Vec<LocalVariable>,
    pub groups: Vec<ReferenceGroup>,
    pub schedule: KernelSchedule,
    pub items: Vec<ScheduleItem>,
    pub unrolled: Vec<bool>,
    pub ast: AstNode,
}

impl Kernel {
    /// Bytes of shared memory used by the kernel
    pub fn shared_memory(&self) -> i64 {
        self.variables
            .iter()
            .filter(|v| v.placement == Placement::Shared)
            .map(|v| v.bytes)
            .sum()
    }

    pub fn variable(&self, name: &str) -> Option<&LocalVariable> {
        self.variables.iter().find(|v| v.name == name)
    }
}

/// Builds kernel `id` from its analysis context, placed groups and body.
pub fn assemble(
    id: usize,
    ctx: &KernelContext,
    groups: Vec<ReferenceGroup>,
    body: BodySchedule,
    builder: &mut dyn AstBuilder,
) -> Result<Kernel> {
    let ast = builder.build(&body)?;

    let mut arrays = Vec::new();
    for array in &ctx.scop.arrays {
        let refs = ctx.references_to(&array.name);
        if refs.is_empty() {
            continue;
        }
        let extent = infer_extent(&ctx.access_map(&refs, 0)?)?;
        arrays.push(LocalizedArray {
            name: array.name.clone(),
            element_type: array.element_type.clone(),
            element_size: array.element_size,
            extent,
            read_only: refs
                .iter()
                .filter_map(|&r| ctx.reference(r))
                .all(|r| r.access.is_read()),
        });
    }

    let mut variables = Vec::new();
    for group in &groups {
        let tile = match group.tile() {
            Some(tile) => tile,
            None => continue,
        };
        let placement = group.placement();
        let n_groups = groups.iter().filter(|g| g.array == group.array).count();
        let name = local_name(placement, &group.array, group.nr, n_groups);
        let element_size = ctx.array(&group.array)?.element_size;
        variables.push(LocalVariable {
            tiling: tile.tiling_map(&name),
            name,
            array: group.array.clone(),
            placement,
            sizes: tile.sizes(),
            element_count: tile.element_count(),
            bytes: tile.footprint(element_size),
        });
    }

    let sched = body.schedule;
    let n_program = sched.n_program_param;
    let block_ids = sched.param_names[n_program..n_program + sched.n_grid].to_vec();
    let thread_ids = sched.param_names[n_program + sched.n_grid..].to_vec();
    // innermost band member is x
    let grid_size: Vec<i64> = sched.grid_sizes.iter().rev().copied().collect();
    let block_size: Vec<i64> = sched.block_sizes.iter().rev().copied().collect();

    let kernel = Kernel {
        id,
        param_names: sched.param_names.clone(),
        context: sched.context.clone(),
        grid_size,
        block_size,
        block_ids,
        thread_ids,
        arrays,
        variables,
        groups,
        items: body.items,
        unrolled: body.unrolled,
        schedule: sched,
        ast,
    };
    info!(
        "kernel {}: grid {:?}, block {:?}, {} local variable(s), {} bytes of shared memory",
        id,
        kernel.grid_size,
        kernel.block_size,
        kernel.variables.len(),
        kernel.shared_memory()
    );
    Ok(kernel)
}
