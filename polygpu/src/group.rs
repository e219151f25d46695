//! Reference grouping
//!
//! References to one array are partitioned into groups that are copied to
//! and from local memory together. Groups are formed in three rounds:
//!
//! 1. references whose accesses overlap within one shared-level iteration are
//!    merged when one side writes,
//! 2. after tiles are computed, groups that still overlap at the level where
//!    their copies are placed are merged when one side writes,
//! 3. overlapping shared tiles are coalesced when the merged tile is
//!    strictly smaller than the two separate tiles.
//!
//! Every round runs to a fixed point, so re-running any of them on the final
//! groups changes nothing.

use std::mem;

use log::{debug, trace};
use serde::Serialize;

use crate::analysis::KernelContext;
use crate::error::{GpuError, Result};
use crate::placement::compute_group_bounds;
use crate::scop::RefId;
use crate::tile::{Placement, Tile};

/// A set of references to one array copied together
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReferenceGroup {
    pub array: String,
    /// Index of the group among the groups of its array
    pub nr: usize,
    /// References in declaration order
    pub refs: Vec<RefId>,
    pub write: bool,
    /// Every write of the group is exact
    pub exact_write: bool,
    pub force_private: bool,
    pub shared_tile: Option<Tile>,
    pub private_tile: Option<Tile>,
    /// Deepest schedule coordinate the shared tile depends on, `None` when
    /// copies sit outside every schedule coordinate
    pub last_shared: Option<usize>,
}

impl ReferenceGroup {
    pub fn new(ctx: &KernelContext, id: RefId) -> Result<Self> {
        let info = ctx
            .reference(id)
            .ok_or_else(|| GpuError::InvalidProgram(format!("unknown reference {}", id)))?;
        let access = info.access;
        let array = ctx.array(&access.array)?;
        Ok(Self {
            array: access.array.clone(),
            nr: 0,
            refs: vec![id],
            write: access.is_write(),
            exact_write: !access.is_write() || access.exact,
            force_private: array.force_private,
            shared_tile: None,
            private_tile: None,
            last_shared: ctx.schedule.shared_len().checked_sub(1),
        })
    }

    pub fn placement(&self) -> Placement {
        if self.private_tile.is_some() {
            Placement::Private
        } else if self.shared_tile.is_some() {
            Placement::Shared
        } else {
            Placement::Global
        }
    }

    /// Tile of the current placement
    pub fn tile(&self) -> Option<&Tile> {
        match self.placement() {
            Placement::Private => self.private_tile.as_ref(),
            Placement::Shared => self.shared_tile.as_ref(),
            Placement::Global => None,
        }
    }

    /// Number of schedule coordinates enclosing the copies of this group
    pub fn copy_level(&self) -> usize {
        self.last_shared.map_or(0, |l| l + 1)
    }

    /// Union of two groups; tiles are dropped and must be recomputed
    fn merge(self, other: ReferenceGroup, ctx: &KernelContext) -> ReferenceGroup {
        let mut refs = self.refs;
        refs.extend(other.refs);
        refs.sort_by_key(|&id| ctx.order_of(id));
        ReferenceGroup {
            array: self.array,
            nr: self.nr,
            refs,
            write: self.write || other.write,
            exact_write: self.exact_write && other.exact_write,
            force_private: self.force_private || other.force_private,
            shared_tile: None,
            private_tile: None,
            last_shared: self.last_shared.max(other.last_shared),
        }
    }
}

/// Groups the references of the kernel, array by array in declaration order.
///
/// Returned groups carry their tiles; budget and unroll checks happen later.
pub fn group_references(ctx: &KernelContext) -> Result<Vec<ReferenceGroup>> {
    let mut all = Vec::new();
    for array in &ctx.scop.arrays {
        let refs = ctx.references_to(&array.name);
        if refs.is_empty() {
            continue;
        }
        let mut groups = refs
            .iter()
            .map(|&id| ReferenceGroup::new(ctx, id))
            .collect::<Result<Vec<_>>>()?;

        let shared_depth = ctx.effective_depth(ctx.schedule.shared_len());
        merge_overlapping(ctx, &mut groups, |_, _| shared_depth, false)?;
        for group in &mut groups {
            compute_group_bounds(ctx, group)?;
        }
        merge_on_last_shared(ctx, &mut groups)?;
        coalesce_shared_tiles(ctx, &mut groups)?;

        for (nr, group) in groups.iter_mut().enumerate() {
            group.nr = nr;
        }
        debug!(
            "array {}: {} reference(s) in {} group(s)",
            array.name,
            refs.len(),
            groups.len()
        );
        all.extend(groups);
    }
    Ok(all)
}

/// Repeatedly merges the first pair of groups, one of which writes, whose
/// accesses overlap at the depth `depth_of` picks for the pair.
///
/// Returns whether anything was merged. With `recompute`, merged groups get
/// fresh tiles.
fn merge_overlapping<F>(
    ctx: &KernelContext,
    groups: &mut Vec<ReferenceGroup>,
    depth_of: F,
    recompute: bool,
) -> Result<bool>
where
    F: Fn(&ReferenceGroup, &ReferenceGroup) -> usize,
{
    let mut merged_any = false;
    while let Some((i, j)) = find_pair(groups, |a, b| {
        if !(a.write || b.write) {
            return Ok(false);
        }
        let depth = depth_of(a, b);
        let ma = ctx.access_map(&a.refs, depth)?;
        let mb = ctx.access_map(&b.refs, depth)?;
        Ok(ma.overlaps(&mb)?)
    })? {
        trace!("merging groups {:?} and {:?}", groups[i].refs, groups[j].refs);
        let other = groups.remove(j);
        let first = mem::replace(&mut groups[i], placeholder());
        groups[i] = first.merge(other, ctx);
        if recompute {
            compute_group_bounds(ctx, &mut groups[i])?;
        }
        merged_any = true;
    }
    Ok(merged_any)
}

/// Merges groups that overlap within the loops enclosing their copies.
fn merge_on_last_shared(ctx: &KernelContext, groups: &mut Vec<ReferenceGroup>) -> Result<bool> {
    merge_overlapping(
        ctx,
        groups,
        |a, b| a.copy_level().min(b.copy_level()),
        true,
    )
}

/// Merges overlapping shared tiles when the union needs fewer bytes.
fn coalesce_shared_tiles(ctx: &KernelContext, groups: &mut Vec<ReferenceGroup>) -> Result<()> {
    let element_size = match groups.first() {
        Some(g) => ctx.array(&g.array)?.element_size,
        None => return Ok(()),
    };
    let depth = ctx.effective_depth(ctx.schedule.shared_len());
    'restart: loop {
        for i in 0..groups.len() {
            for j in i + 1..groups.len() {
                let (a, b) = (&groups[i], &groups[j]);
                let (ta, tb) = match (&a.shared_tile, &b.shared_tile) {
                    (Some(ta), Some(tb)) => (ta, tb),
                    _ => continue,
                };
                let ma = ctx.access_map(&a.refs, depth)?;
                let mb = ctx.access_map(&b.refs, depth)?;
                if !ma.overlaps(&mb)? {
                    continue;
                }
                let separate = ta
                    .footprint(element_size)
                    .saturating_add(tb.footprint(element_size));
                let mut merged = a.clone().merge(b.clone(), ctx);
                compute_group_bounds(ctx, &mut merged)?;
                let fits = merged
                    .shared_tile
                    .as_ref()
                    .map_or(false, |t| t.footprint(element_size) < separate);
                if !fits {
                    continue;
                }
                let lowered = merged.last_shared < a.last_shared || merged.last_shared < b.last_shared;
                debug!(
                    "coalescing shared tiles of {} groups {} and {}",
                    merged.array, a.nr, b.nr
                );
                groups.remove(j);
                groups[i] = merged;
                if lowered {
                    merge_on_last_shared(ctx, groups)?;
                }
                continue 'restart;
            }
        }
        return Ok(());
    }
}

/// First pair `(i, j)`, `i < j`, satisfying `pred`
fn find_pair<F>(groups: &[ReferenceGroup], mut pred: F) -> Result<Option<(usize, usize)>>
where
    F: FnMut(&ReferenceGroup, &ReferenceGroup) -> Result<bool>,
{
    for i in 0..groups.len() {
        for j in i + 1..groups.len() {
            if pred(&groups[i], &groups[j])? {
                return Ok(Some((i, j)));
            }
        }
    }
    Ok(None)
}

fn placeholder() -> ReferenceGroup {
    ReferenceGroup {
        array: String::new(),
        nr: 0,
        refs: Vec::new(),
        write: false,
        exact_write: true,
        force_private: false,
        shared_tile: None,
        private_tile: None,
        last_shared: None,
    }
}
