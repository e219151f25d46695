//! Kernel body scheduling
//!
//! Statements, copies between global and local memory, and barriers are
//! ordered by time vectors of length `2d + 1` that interleave slots with the
//! `d` schedule coordinates:
//!
//! ```text
//! [slot, c0, slot, c1, ..., slot, c(d-1), slot]
//! ```
//!
//! Statements sit in the body slot everywhere. A copy at level `L` follows
//! the statement coordinates below `L` and then takes the copy-in or copy-out
//! slot, so it runs once per iteration of the loops enclosing it:
//!
//! | slot | content      |
//! |------|--------------|
//! | 0    | copy-in      |
//! | 1    | barrier      |
//! | 2    | body         |
//! | 3    | barrier      |
//! | 4    | copy-out     |
//! | 5    | trailing barrier |

use std::collections::BTreeMap;

use log::debug;
use serde::Serialize;

use crate::analysis::KernelContext;
use crate::error::Result;
use crate::group::ReferenceGroup;
use crate::schedule::{KernelSchedule, ScheduleStage, StatementSchedule};
use crate::scop::RefId;
use crate::tile::{local_name, Placement};

const COPY_IN: i64 = 0;
const SYNC_BEFORE: i64 = 1;
const BODY: i64 = 2;
const SYNC_AFTER: i64 = 3;
const COPY_OUT: i64 = 4;
const SYNC_TRAILING: i64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CopyDirection {
    In,
    Out,
}

/// Entry of a time vector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TimeCoord {
    /// Ordering slot between schedule coordinates
    Slot(i64),
    /// Value of schedule coordinate `j` of the item's statement
    Dim(usize),
    Const(i64),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ItemKind {
    Statement {
        /// Position in [`KernelSchedule::statements`]
        index: usize,
        name: String,
    },
    Copy {
        /// Position in the kernel's group list
        group: usize,
        var: String,
        direction: CopyDirection,
        placement: Placement,
        /// References whose elements cross between global and local memory
        refs: Vec<RefId>,
    },
    Sync,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduleItem {
    pub kind: ItemKind,
    pub time: Vec<TimeCoord>,
}

impl ScheduleItem {
    /// Number of schedule coordinates enclosing the item
    pub fn level(&self) -> usize {
        (self.time.len() - 1) / 2
    }
}

/// Ordered kernel body
#[derive(Debug, Clone, Serialize)]
pub struct BodySchedule {
    pub schedule: KernelSchedule,
    pub items: Vec<ScheduleItem>,
    /// Per schedule coordinate, is the loop unrolled?
    pub unrolled: Vec<bool>,
}

#[derive(Default)]
struct BarrierNeeds {
    before: bool,
    after: bool,
    statements: Vec<usize>,
}

#[derive(Clone, Copy)]
enum Pick {
    First,
    Last,
}

/// Orders statements, copies and barriers of the kernel.
pub fn schedule_body(ctx: &KernelContext, groups: &[ReferenceGroup]) -> Result<BodySchedule> {
    let mut schedule = ctx.schedule.clone();
    let depth = schedule.depth();

    let mut items = Vec::new();
    for (index, st) in schedule.statements.iter().enumerate() {
        let mut time = Vec::with_capacity(2 * depth + 1);
        for j in 0..depth {
            time.push(TimeCoord::Slot(BODY));
            time.push(statement_coord(&schedule, st, j));
        }
        time.push(TimeCoord::Slot(BODY));
        items.push(ScheduleItem {
            kind: ItemKind::Statement {
                index,
                name: ctx.scop.statements[st.stmt].name.clone(),
            },
            time,
        });
    }

    let mut barriers: BTreeMap<usize, BarrierNeeds> = BTreeMap::new();
    for (gi, group) in groups.iter().enumerate() {
        let placement = group.placement();
        let level = match placement {
            Placement::Global => continue,
            Placement::Shared => group.copy_level(),
            Placement::Private => private_copy_level(&schedule, group),
        };
        let (copy_in, copy_out) = copy_needs(ctx, group, level)?;
        let statements = statements_of(ctx, group);
        let n_groups = groups.iter().filter(|g| g.array == group.array).count();
        let var = local_name(placement, &group.array, group.nr, n_groups);
        debug!(
            "{} at level {}: copy-in {:?}, copy-out {:?}",
            var, level, copy_in, copy_out
        );
        let (has_in, has_out) = (!copy_in.is_empty(), !copy_out.is_empty());

        for (refs, direction, slot, pick) in [
            (copy_in, CopyDirection::In, COPY_IN, Pick::First),
            (copy_out, CopyDirection::Out, COPY_OUT, Pick::Last),
        ] {
            if refs.is_empty() {
                continue;
            }
            let mut time = prefix(&schedule, level, &statements, pick);
            time.push(TimeCoord::Slot(slot));
            time.push(TimeCoord::Const(gi as i64));
            items.push(ScheduleItem {
                kind: ItemKind::Copy {
                    group: gi,
                    var: var.clone(),
                    direction,
                    placement,
                    refs,
                },
                time,
            });
        }

        if placement == Placement::Shared && (has_in || has_out) {
            let needs = barriers.entry(level).or_default();
            needs.before |= has_in;
            needs.after |= has_out;
            needs.statements.extend(statements);
        }
    }

    for (level, needs) in &barriers {
        let mut push = |slot: i64, pick: Pick| {
            let mut time = prefix(&schedule, *level, &needs.statements, pick);
            time.push(TimeCoord::Slot(slot));
            items.push(ScheduleItem {
                kind: ItemKind::Sync,
                time,
            });
        };
        if needs.before {
            push(SYNC_BEFORE, Pick::First);
        }
        if needs.after {
            push(SYNC_AFTER, Pick::Last);
        }
        if has_enclosing_loop(&schedule, *level) {
            push(SYNC_TRAILING, Pick::Last);
        }
    }

    schedule.stage.advance(ScheduleStage::BodyScheduled);
    Ok(BodySchedule {
        unrolled: vec![false; depth],
        schedule,
        items,
    })
}

/// Moves the point loops in `unroll` innermost and marks them unrolled.
pub fn interchange_for_unroll(body: &mut BodySchedule, unroll: &[usize]) {
    let sched = &mut body.schedule;
    let depth = sched.depth();
    let start = sched.private_len();
    if unroll.is_empty() {
        return;
    }

    let mut order: Vec<usize> = (start..depth).filter(|p| !unroll.contains(p)).collect();
    order.extend(unroll.iter().copied().filter(|&p| p >= start && p < depth));
    let mut new_of_old: Vec<usize> = (0..depth).collect();
    for (k, &old) in order.iter().enumerate() {
        new_of_old[old] = start + k;
    }

    let levels = sched.levels.clone();
    for (k, &old) in order.iter().enumerate() {
        sched.levels[start + k] = levels[old];
    }
    for st in &mut sched.statements {
        let dims = st.dims.clone();
        for (k, &old) in order.iter().enumerate() {
            st.dims[start + k] = dims[old].clone();
        }
    }
    for item in &mut body.items {
        if item.time.len() != 2 * depth + 1 {
            continue;
        }
        let time = item.time.clone();
        for (k, &old) in order.iter().enumerate() {
            item.time[2 * (start + k) + 1] = match time[2 * old + 1] {
                TimeCoord::Dim(j) => TimeCoord::Dim(new_of_old[j]),
                other => other,
            };
        }
    }

    body.unrolled = vec![false; depth];
    for &p in unroll {
        if p < depth {
            body.unrolled[new_of_old[p]] = true;
        }
    }
    sched.stage.advance(ScheduleStage::UnrollInterchanged);
    debug!("unrolling point loops {:?}", unroll);
}

fn statement_coord(sched: &KernelSchedule, st: &StatementSchedule, j: usize) -> TimeCoord {
    if sched.is_constant_dim(j) {
        TimeCoord::Const(st.dims[j].constant)
    } else {
        TimeCoord::Dim(j)
    }
}

/// Time vector prefix of an item at `level` serving `statements`
fn prefix(sched: &KernelSchedule, level: usize, statements: &[usize], pick: Pick) -> Vec<TimeCoord> {
    let mut time = Vec::with_capacity(2 * level + 2);
    for j in 0..level {
        time.push(TimeCoord::Slot(BODY));
        if sched.is_constant_dim(j) {
            let values = statements.iter().map(|&s| sched.statements[s].dims[j].constant);
            let value = match pick {
                Pick::First => values.min(),
                Pick::Last => values.max(),
            };
            time.push(TimeCoord::Const(value.unwrap_or(0)));
        } else {
            time.push(TimeCoord::Dim(j));
        }
    }
    time
}

/// Is there a sequential loop inside the kernel enclosing level `level`?
fn has_enclosing_loop(sched: &KernelSchedule, level: usize) -> bool {
    (sched.tile_first..level.min(sched.depth()))
        .any(|j| !sched.levels[j].is_mapped() && !sched.is_constant_dim(j))
}

/// Private copies sit just below the deepest loop their tile depends on.
///
/// Block and thread ids are fixed for the whole kernel and never move the
/// tile, so a tile that only depends on ids is copied right inside the block
/// ids.
fn private_copy_level(sched: &KernelSchedule, group: &ReferenceGroup) -> usize {
    group
        .private_tile
        .as_ref()
        .and_then(|t| {
            t.deepest_outer_dependence(sched.tile_first, |j| {
                sched.levels.get(j).map_or(true, |l| !l.is_mapped())
            })
        })
        .map_or(sched.tile_first + sched.n_grid, |d| d + 1)
}

/// Statements (positions in the kernel schedule) referenced by `group`
fn statements_of(ctx: &KernelContext, group: &ReferenceGroup) -> Vec<usize> {
    let mut stmts: Vec<usize> = group
        .refs
        .iter()
        .filter_map(|&id| ctx.reference(id).map(|r| r.sched_idx))
        .collect();
    stmts.sort_unstable();
    stmts.dedup();
    stmts
}

/// References of `group` to copy in and to copy out at `level`.
///
/// Reads produced by an exact write of the group earlier in the same
/// iteration need no copy-in; inexact writes are copied in so that the
/// elements they skip keep their values. Writes are copied out unless the
/// array is local to the program and every read of it is a covered read.
fn copy_needs(
    ctx: &KernelContext,
    group: &ReferenceGroup,
    level: usize,
) -> Result<(Vec<RefId>, Vec<RefId>)> {
    let mut reads = Vec::new();
    let mut writes = Vec::new();
    for &id in &group.refs {
        if let Some(info) = ctx.reference(id) {
            if info.access.is_write() {
                writes.push(id);
            } else {
                reads.push(id);
            }
        }
    }

    let mut copy_in = Vec::new();
    for &r in &reads {
        let mut covered = false;
        for &w in &writes {
            if ctx.is_covered_in_granule(r, w, level)? {
                covered = true;
                break;
            }
        }
        if !covered {
            copy_in.push(r);
        }
    }
    let all_covered = copy_in.is_empty();
    if !group.exact_write {
        copy_in.extend(&writes);
        copy_in.sort_by_key(|&id| ctx.order_of(id));
    }

    let copy_out = if group.write {
        let array = ctx.array(&group.array)?;
        let reads_elsewhere = ctx
            .scop
            .statements
            .iter()
            .flat_map(|s| &s.accesses)
            .filter(|a| a.array == group.array && a.is_read())
            .count()
            > reads.len();
        if array.local && all_covered && !reads_elsewhere {
            Vec::new()
        } else {
            writes
        }
    } else {
        Vec::new()
    };
    Ok((copy_in, copy_out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GpuOptions;
    use crate::group::group_references;
    use crate::placement::{check_unroll, enforce_shared_budget};
    use crate::schedule::LevelKind;
    use crate::scop::{Scop, ScopBuilder};

    fn body_of(scop: &Scop, options: &GpuOptions) -> BodySchedule {
        let sched = KernelSchedule::build(scop, &scop.regions[0], options).unwrap();
        let ctx = KernelContext::new(scop, options, sched);
        let mut groups = group_references(&ctx).unwrap();
        let unroll = check_unroll(&ctx, &mut groups).unwrap();
        enforce_shared_budget(&ctx, &mut groups).unwrap();
        let mut body = schedule_body(&ctx, &groups).unwrap();
        interchange_for_unroll(&mut body, &unroll);
        body
    }

    fn count(body: &BodySchedule, pred: impl Fn(&ItemKind) -> bool) -> usize {
        body.items.iter().filter(|i| pred(&i.kind)).count()
    }

    #[test]
    fn test_shared_copy_in_with_barriers() {
        // for i: for j: B[i][j] = A[j]
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
        let scop = b.build().unwrap();

        let body = body_of(&scop, &GpuOptions::default());
        let shared_len = body.schedule.shared_len();
        assert_eq!(body.schedule.stage, ScheduleStage::BodyScheduled);
        assert_eq!(count(&body, |k| matches!(k, ItemKind::Statement { .. })), 1);
        let copies: Vec<_> = body
            .items
            .iter()
            .filter(|i| matches!(i.kind, ItemKind::Copy { .. }))
            .collect();
        assert_eq!(copies.len(), 1);
        assert_eq!(copies[0].level(), shared_len);
        assert!(matches!(
            &copies[0].kind,
            ItemKind::Copy { var, direction: CopyDirection::In, placement: Placement::Shared, .. }
                if var == "shared_A"
        ));
        // barrier after the copy-in and a trailing one for the tile loops
        let syncs: Vec<_> = body
            .items
            .iter()
            .filter(|i| i.kind == ItemKind::Sync)
            .map(|i| i.time[2 * shared_len])
            .collect();
        assert_eq!(
            syncs,
            vec![TimeCoord::Slot(SYNC_BEFORE), TimeCoord::Slot(SYNC_TRAILING)]
        );
    }

    #[test]
    fn test_covered_local_temporary_needs_no_copies() {
        // for i: for k: { T[i] = A[i][k]; B[i][k] = T[i]; }
        let mut b = ScopBuilder::new();
        b.param("N");
        b.context("N >= 1").unwrap();
        b.array("A", "float", 4, 2);
        b.array("B", "float", 4, 2);
        b.array("T", "float", 4, 1).local = true;
        let dom = "0 <= i < N and 0 <= k < N";
        let s0 = b.statement("S0", &["i", "k"], dom, &["i", "k", "0"]).unwrap();
        b.read(s0, "A", &["i", "k"]).unwrap();
        b.write(s0, "T", &["i"]).unwrap();
        let s1 = b.statement("S1", &["i", "k"], dom, &["i", "k", "1"]).unwrap();
        b.read(s1, "T", &["i"]).unwrap();
        b.write(s1, "B", &["i", "k"]).unwrap();
        b.region(&[s0, s1], 0, 1);
        let scop = b.build().unwrap();

        let body = body_of(&scop, &GpuOptions::default());
        assert_eq!(count(&body, |k| matches!(k, ItemKind::Statement { .. })), 2);
        assert_eq!(count(&body, |k| matches!(k, ItemKind::Copy { .. })), 0);
        assert_eq!(count(&body, |k| *k == ItemKind::Sync), 0);
    }

    #[test]
    fn test_copies_carry_only_uncovered_reads() {
        // for i: for k: { T[i] = A[i][k]; B[i][k] = T[i] + T[i + 1]; }
        let mut b = ScopBuilder::new();
        b.param("N");
        b.context("N >= 1").unwrap();
        b.array("A", "float", 4, 2);
        b.array("B", "float", 4, 2);
        b.array("T", "float", 4, 1).local = true;
        let dom = "0 <= i < N and 0 <= k < N";
        let s0 = b.statement("S0", &["i", "k"], dom, &["i", "k", "0"]).unwrap();
        b.read(s0, "A", &["i", "k"]).unwrap();
        b.write(s0, "T", &["i"]).unwrap();
        let s1 = b.statement("S1", &["i", "k"], dom, &["i", "k", "1"]).unwrap();
        b.read(s1, "T", &["i"]).unwrap();
        b.read(s1, "T", &["i + 1"]).unwrap();
        b.write(s1, "B", &["i", "k"]).unwrap();
        b.region(&[s0, s1], 0, 1);
        let scop = b.build().unwrap();

        let body = body_of(&scop, &GpuOptions::default());
        let copies: Vec<_> = body
            .items
            .iter()
            .filter_map(|i| match &i.kind {
                ItemKind::Copy { var, direction, refs, .. } if var.ends_with("_T") => {
                    Some((*direction, refs.clone()))
                }
                _ => None,
            })
            .collect();
        // T[i] is produced by S0 in the same iteration, T[i + 1] is not
        assert_eq!(
            copies,
            vec![(CopyDirection::In, vec![3]), (CopyDirection::Out, vec![1])]
        );
    }

    #[test]
    fn test_private_copies_stay_outside_reduction_loop() {
        // C[i][j] += A[i][k] * B[k][j], k carries the reduction
        let mut b = ScopBuilder::new();
        b.param("N");
        b.context("N >= 1").unwrap();
        b.array("A", "float", 4, 2);
        b.array("B", "float", 4, 2);
        b.array("C", "float", 4, 2);
        let s = b
            .statement(
                "S",
                &["i", "j", "k"],
                "0 <= i < N and 0 <= j < N and 0 <= k < N",
                &["i", "j", "k"],
            )
            .unwrap();
        b.read(s, "C", &["i", "j"]).unwrap();
        b.read(s, "A", &["i", "k"]).unwrap();
        b.read(s, "B", &["k", "j"]).unwrap();
        b.write(s, "C", &["i", "j"]).unwrap();
        b.region(&[s], 0, 3);
        b.regions_mut()[0].coincident = vec![true, true, false];
        let scop = b.build().unwrap();

        let body = body_of(&scop, &GpuOptions::default());
        let reduction = body.schedule.tile_loop_pos(2);
        let copies: Vec<_> = body
            .items
            .iter()
            .filter(|i| matches!(&i.kind, ItemKind::Copy { var, .. } if var == "private_C"))
            .collect();
        assert_eq!(copies.len(), 2);
        for copy in copies {
            // once per (i, j) tile, not once per k tile
            assert_eq!(copy.level(), reduction);
            assert!(!copy.time.contains(&TimeCoord::Dim(reduction)));
        }
    }

    #[test]
    fn test_unrolled_point_loop_moves_innermost() {
        // for i: for j: A[i] += B[i][j], four threads per tile
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
        let scop = b.build().unwrap();
        let options = GpuOptions {
            block_sizes: vec![4],
            ..GpuOptions::default()
        };

        let body = body_of(&scop, &options);
        let depth = body.schedule.depth();
        assert_eq!(body.schedule.stage, ScheduleStage::UnrollInterchanged);
        assert_eq!(body.schedule.levels[depth - 1], LevelKind::PointLoop);
        assert_eq!(body.schedule.levels[depth - 2], LevelKind::Inner);
        assert_eq!(body.unrolled.iter().filter(|&&u| u).count(), 1);
        assert!(body.unrolled[depth - 1]);

        // A is copied into registers once per thread and back out
        let copies: Vec<_> = body
            .items
            .iter()
            .filter_map(|i| match &i.kind {
                ItemKind::Copy { var, direction, .. } => Some((var.clone(), *direction)),
                _ => None,
            })
            .collect();
        assert_eq!(
            copies,
            vec![
                ("private_A".to_string(), CopyDirection::In),
                ("private_A".to_string(), CopyDirection::Out)
            ]
        );
        assert_eq!(count(&body, |k| *k == ItemKind::Sync), 0);
    }
}
