//! Memory placement of reference groups
//!
//! Decides for every group whether it is copied to shared memory, to private
//! registers, or stays in global memory.

use std::collections::BTreeSet;

use log::{debug, info, warn};

use crate::analysis::KernelContext;
use crate::error::{GpuError, Result};
use crate::group::ReferenceGroup;
use crate::tile::can_tile;

/// Computes the shared and private tiles of `group` and its copy level.
///
/// Read-only scalars and arrays of compound elements are never tiled; other
/// groups need exact writes unless their array is forced into private
/// memory. A forced group that cannot be tiled privately is an error.
pub fn compute_group_bounds(ctx: &KernelContext, group: &mut ReferenceGroup) -> Result<()> {
    let sched = &ctx.schedule;
    group.shared_tile = None;
    group.private_tile = None;
    group.last_shared = sched.shared_len().checked_sub(1);

    let array = ctx.array(&group.array)?;
    if array.is_read_only_scalar() || array.has_compound_element {
        return Ok(());
    }
    if !group.force_private && !group.exact_write {
        debug!("{}: inexact writes, kept in global memory", group.array);
        return Ok(());
    }

    let options = ctx.options;
    let reuse = ctx.has_reuse(&group.refs)?;
    if options.use_shared_memory && (reuse || !ctx.is_coalesced(&group.refs)?) {
        let map = ctx.access_map(&group.refs, sched.shared_len())?;
        group.shared_tile = can_tile(&map)?;
        if let Some(tile) = &group.shared_tile {
            group.last_shared = tile
                .deepest_outer_dependence(sched.tile_first, |_| true)
                .or_else(|| sched.tile_first.checked_sub(1));
        }
    }

    let try_private = group.force_private
        || (options.use_private_memory && reuse && ctx.is_bijective(&group.refs)?);
    if try_private {
        let map = ctx.access_map(&group.refs, sched.private_len())?;
        group.private_tile = can_tile(&map)?;
        if group.private_tile.is_none() && group.force_private {
            return Err(GpuError::PlacementViolation {
                array: group.array.clone(),
            });
        }
    }
    Ok(())
}

/// Demotes shared tiles that do not fit in the shared memory budget.
///
/// Groups are visited in declaration order; every shared group whose tile
/// exceeds what is left of the budget is moved to global memory.
pub fn enforce_shared_budget(ctx: &KernelContext, groups: &mut [ReferenceGroup]) -> Result<()> {
    let mut left = ctx.options.max_shared_memory;
    for group in groups.iter_mut() {
        if group.private_tile.is_some() {
            continue;
        }
        let size = match &group.shared_tile {
            Some(tile) => tile.footprint(ctx.array(&group.array)?.element_size),
            None => continue,
        };
        if size > left {
            info!(
                "{} group {}: {} bytes exceed the {} bytes left in shared memory",
                group.array, group.nr, size, left
            );
            group.shared_tile = None;
        } else {
            left -= size;
        }
    }
    Ok(())
}

/// Checks that the point loops private tiles are indexed by may be unrolled.
///
/// A point loop may only be unrolled when its band member is coincident. A
/// group violating this loses its private tile; if the group was forced into
/// private memory, all private placements of the kernel are abandoned.
/// Returns the schedule positions of the point loops to unroll.
pub fn check_unroll(ctx: &KernelContext, groups: &mut [ReferenceGroup]) -> Result<Vec<usize>> {
    let sched = &ctx.schedule;
    let start = sched.private_len();
    let mut unroll = BTreeSet::new();
    let mut abandon = false;

    for group in groups.iter_mut() {
        if group.private_tile.is_none() {
            continue;
        }
        let mut dims = Vec::new();
        for pos in start..start + sched.tile_len {
            if ctx.depends_on(&group.refs, pos)? {
                dims.push(pos);
            }
        }
        let parallel = dims.iter().all(|&pos| {
            sched
                .band_member_of_point(pos)
                .map_or(false, |k| sched.coincident[k])
        });
        if parallel {
            unroll.extend(dims);
        } else if group.force_private {
            warn!(
                "{}: point loops of a forced private array cannot be unrolled, abandoning private memory",
                group.array
            );
            abandon = true;
        } else {
            debug!("{} group {}: point loops not unrollable", group.array, group.nr);
            group.private_tile = None;
        }
    }

    if abandon {
        for group in groups.iter_mut() {
            group.private_tile = None;
        }
        return Ok(Vec::new());
    }
    Ok(unroll.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GpuOptions;
    use crate::group::group_references;
    use crate::schedule::KernelSchedule;
    use crate::scop::{Scop, ScopBuilder};
    use crate::tile::Placement;

    /// `for i: for j: B[i][j] = A[j]`, coalesced read of `A` reused across `i`
    fn broadcast() -> Scop {
        let mut b = ScopBuilder::new();
        b.param("N");
        b.context("N >= 64").unwrap();
        b.array("A", "double", 8, 1);
        b.array("B", "double", 8, 2);
        let s = b
            .statement("S", &["i", "j"], "0 <= i < N and 0 <= j < N", &["i", "j"])
            .unwrap();
        b.read(s, "A", &["j"]).unwrap();
        b.write(s, "B", &["i", "j"]).unwrap();
        b.region(&[s], 0, 2);
        b.build().unwrap()
    }

    fn placed(scop: &Scop, options: &GpuOptions) -> Vec<ReferenceGroup> {
        let sched = KernelSchedule::build(scop, &scop.regions[0], options).unwrap();
        let ctx = KernelContext::new(scop, options, sched);
        let mut groups = group_references(&ctx).unwrap();
        check_unroll(&ctx, &mut groups).unwrap();
        enforce_shared_budget(&ctx, &mut groups).unwrap();
        groups
    }

    #[test]
    fn test_reused_read_goes_to_shared_memory() {
        let groups = placed(&broadcast(), &GpuOptions::default());
        assert_eq!(groups[0].array, "A");
        assert_eq!(groups[0].placement(), Placement::Shared);
        assert_eq!(groups[0].shared_tile.as_ref().unwrap().sizes(), vec![32]);
        // B[i][j] is coalesced and never reused
        assert_eq!(groups[1].placement(), Placement::Global);
    }

    #[test]
    fn test_budget_demotes_in_declaration_order() {
        let options = GpuOptions {
            max_shared_memory: 0,
            ..GpuOptions::default()
        };
        let groups = placed(&broadcast(), &options);
        assert!(groups.iter().all(|g| g.placement() == Placement::Global));

        let options = GpuOptions {
            max_shared_memory: 256,
            ..GpuOptions::default()
        };
        let groups = placed(&broadcast(), &options);
        assert_eq!(groups[0].placement(), Placement::Shared);
    }

    #[test]
    fn test_disabled_shared_memory() {
        let options = GpuOptions {
            use_shared_memory: false,
            ..GpuOptions::default()
        };
        let groups = placed(&broadcast(), &options);
        assert!(groups.iter().all(|g| g.shared_tile.is_none()));
    }

    #[test]
    fn test_inexact_write_stays_global() {
        let mut b = ScopBuilder::new();
        b.param("N");
        b.context("N >= 1").unwrap();
        b.array("A", "float", 4, 1);
        let s = b
            .statement("S", &["i", "j"], "0 <= i < N and 0 <= j < N", &["i", "j"])
            .unwrap();
        b.read(s, "A", &["i"]).unwrap();
        b.may_write(s, "A", &["i"]).unwrap();
        b.region(&[s], 0, 1);
        let scop = b.build().unwrap();
        let groups = placed(&scop, &GpuOptions::default());
        assert_eq!(groups.len(), 1);
        assert!(!groups[0].exact_write);
        assert_eq!(groups[0].placement(), Placement::Global);
    }

    /// `for i: for j: A[i] += B[i][j]` with four threads per 32-wide tile
    fn accumulate(coincident: bool) -> (Scop, GpuOptions) {
        let mut b = ScopBuilder::new();
        b.param("N");
        b.context("N >= 1").unwrap();
        b.array("A", "float", 4, 1);
        b.array("B", "float", 4, 2);
        let s = b
            .statement("S", &["i", "j"], "0 <= i < N and 0 <= j < N", &["i", "j"])
            .unwrap();
        b.read(s, "A", &["i"]).unwrap();
        b.read(s, "B", &["i", "j"]).unwrap();
        b.write(s, "A", &["i"]).unwrap();
        b.region(&[s], 0, 1);
        b.regions_mut()[0].coincident = vec![coincident];
        let options = GpuOptions {
            block_sizes: vec![4],
            ..GpuOptions::default()
        };
        (b.build().unwrap(), options)
    }

    #[test]
    fn test_private_tile_unrolls_point_loop() {
        let (scop, options) = accumulate(true);
        let sched = KernelSchedule::build(&scop, &scop.regions[0], &options).unwrap();
        let point = sched.point_loop_pos(0);
        let ctx = KernelContext::new(&scop, &options, sched);
        let mut groups = group_references(&ctx).unwrap();
        let unroll = check_unroll(&ctx, &mut groups).unwrap();
        assert_eq!(unroll, vec![point]);
        let a = groups.iter().find(|g| g.array == "A").unwrap();
        assert_eq!(a.placement(), Placement::Private);
        // every thread owns 8 elements 4 apart
        let tile = a.private_tile.as_ref().unwrap();
        assert_eq!(tile.sizes(), vec![8]);
        assert_eq!(tile.bounds[0].stride.as_ref().map(|s| s.stride), Some(4));
    }

    #[test]
    fn test_private_tile_is_indexed_by_thread_ids() {
        let (scop, options) = accumulate(true);
        let groups = placed(&scop, &options);
        let a = groups.iter().find(|g| g.array == "A").unwrap();
        let tile = a.private_tile.as_ref().unwrap();
        let shared = a.shared_tile.as_ref().unwrap();
        // the private tile is the part of the shared tile one thread touches
        let sched = KernelSchedule::build(&scop, &scop.regions[0], &options).unwrap();
        let thread = tile.n_param + sched.shared_len();
        assert_eq!(tile.n_outer, sched.private_len());
        assert!(tile.bounds[0].lower.aff.involves(thread));
        assert!(!shared.bounds[0].lower.aff.involves(thread));
        assert_eq!(shared.element_count(), 4 * tile.element_count());
    }

    #[test]
    fn test_non_coincident_point_loop_drops_private_tile() {
        let (scop, options) = accumulate(false);
        let groups = placed(&scop, &options);
        let a = groups.iter().find(|g| g.array == "A").unwrap();
        assert!(a.private_tile.is_none());
        assert_eq!(a.placement(), Placement::Shared);
    }

    #[test]
    fn test_forced_private_without_bound_is_an_error() {
        // for i: A[k] for all k, an unbounded private tile
        let mut b = ScopBuilder::new();
        b.param("N");
        b.context("N >= 1").unwrap();
        b.array("A", "float", 4, 1).force_private = true;
        let s = b.statement("S", &["i"], "0 <= i < N", &["i"]).unwrap();
        b.access(s, "A", crate::scop::AccessKind::Write, true, &["0..N"]).unwrap();
        b.region(&[s], 0, 1);
        let scop = b.build().unwrap();

        let options = GpuOptions::default();
        let sched = KernelSchedule::build(&scop, &scop.regions[0], &options).unwrap();
        let ctx = KernelContext::new(&scop, &options, sched);
        let err = group_references(&ctx).unwrap_err();
        assert!(matches!(err, GpuError::PlacementViolation { ref array } if array == "A"));
    }
}
