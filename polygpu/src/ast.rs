//! Abstract syntax trees of kernels and of the host code launching them
//!
//! The [`AstBuilder`] trait turns an ordered kernel body into a tree of
//! loops and leaves. Every loop or mapped node carries a [`NodeInfo`] with the
//! role of its schedule coordinate and whether it is unrolled.

use serde::Serialize;

use crate::error::{EngineError, Result};
use crate::schedule::{KernelSchedule, LevelKind};
use crate::scop::RefId;
use crate::sync::{BodySchedule, CopyDirection, ItemKind, ScheduleItem, TimeCoord};
use crate::tile::Placement;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NodeInfo {
    /// Schedule coordinate of the node
    pub level: usize,
    pub kind: LevelKind,
    pub unroll: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum AstNode {
    Block(Vec<AstNode>),
    For {
        info: NodeInfo,
        body: Box<AstNode>,
    },
    /// Coordinate fixed to a block or thread id
    Mapped {
        info: NodeInfo,
        id: String,
        body: Box<AstNode>,
    },
    User {
        /// Position in [`KernelSchedule::statements`]
        index: usize,
        name: String,
    },
    Copy {
        var: String,
        direction: CopyDirection,
        placement: Placement,
        /// References moved by the copy
        refs: Vec<RefId>,
    },
    Sync,
    Launch {
        kernel: usize,
    },
}

impl AstNode {
    /// Leaves in execution order
    pub fn leaves(&self) -> Vec<&AstNode> {
        let mut out = Vec::new();
        self.collect_leaves(&mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a AstNode>) {
        match self {
            AstNode::Block(children) => children.iter().for_each(|c| c.collect_leaves(out)),
            AstNode::For { body, .. } | AstNode::Mapped { body, .. } => body.collect_leaves(out),
            leaf => out.push(leaf),
        }
    }

    /// Loop and mapped nodes enclosing the first leaf satisfying `pred`
    pub fn enclosing(&self, pred: &dyn Fn(&AstNode) -> bool) -> Option<Vec<NodeInfo>> {
        match self {
            AstNode::Block(children) => children.iter().find_map(|c| c.enclosing(pred)),
            AstNode::For { info, body } | AstNode::Mapped { info, body, .. } => {
                body.enclosing(pred).map(|mut path| {
                    path.insert(0, *info);
                    path
                })
            }
            leaf => pred(leaf).then(Vec::new),
        }
    }
}

/// Synthesizes the AST of a kernel body
pub trait AstBuilder {
    fn build(&mut self, body: &BodySchedule) -> Result<AstNode>;
}

/// Builds loop nests by splitting items on their time vectors, one position
/// at a time: slots order sibling subtrees, constant coordinates separate
/// them and variable coordinates become loops.
#[derive(Debug, Default)]
pub struct TreeBuilder;

impl AstBuilder for TreeBuilder {
    fn build(&mut self, body: &BodySchedule) -> Result<AstNode> {
        let items: Vec<&ScheduleItem> = body.items.iter().collect();
        Ok(AstNode::Block(self.nodes(body, &items, 0)?))
    }
}

impl TreeBuilder {
    fn nodes(&self, body: &BodySchedule, items: &[&ScheduleItem], pos: usize) -> Result<Vec<AstNode>> {
        let mut nodes = Vec::new();
        let (leaves, rest): (Vec<&ScheduleItem>, Vec<&ScheduleItem>) =
            items.iter().copied().partition(|i| i.time.len() <= pos);
        nodes.extend(leaves.into_iter().map(leaf));
        if rest.is_empty() {
            return Ok(nodes);
        }

        if pos % 2 == 0 {
            let mut slots = Vec::new();
            for item in &rest {
                match item.time[pos] {
                    TimeCoord::Slot(s) => slots.push(s),
                    other => {
                        return Err(EngineError::SpaceMismatch(format!(
                            "expected a slot at position {}, found {:?}",
                            pos, other
                        ))
                        .into())
                    }
                }
            }
            slots.sort_unstable();
            slots.dedup();
            for s in slots {
                let group: Vec<&ScheduleItem> = rest
                    .iter()
                    .copied()
                    .filter(|i| i.time[pos] == TimeCoord::Slot(s))
                    .collect();
                nodes.extend(self.nodes(body, &group, pos + 1)?);
            }
            return Ok(nodes);
        }

        let j = pos / 2;
        let mut consts: Vec<i64> = rest
            .iter()
            .filter_map(|i| match i.time[pos] {
                TimeCoord::Const(v) => Some(v),
                _ => None,
            })
            .collect();
        consts.sort_unstable();
        consts.dedup();
        for v in consts {
            let group: Vec<&ScheduleItem> = rest
                .iter()
                .copied()
                .filter(|i| i.time[pos] == TimeCoord::Const(v))
                .collect();
            nodes.extend(self.nodes(body, &group, pos + 1)?);
        }

        let looped: Vec<&ScheduleItem> = rest
            .iter()
            .copied()
            .filter(|i| !matches!(i.time[pos], TimeCoord::Const(_)))
            .collect();
        if looped.is_empty() {
            return Ok(nodes);
        }
        let inner = self.nodes(body, &looped, pos + 1)?;
        let sched = &body.schedule;
        let kind = sched.levels.get(j).copied().unwrap_or(LevelKind::Inner);
        let info = NodeInfo {
            level: j,
            kind,
            unroll: body.unrolled.get(j).copied().unwrap_or(false),
        };
        let inner = Box::new(AstNode::Block(inner));
        match kind {
            // host coordinates are fixed for one launch
            LevelKind::Host => nodes.extend(unwrap_block(*inner)),
            LevelKind::BlockId | LevelKind::ThreadId => nodes.push(AstNode::Mapped {
                info,
                id: mapped_id(sched, j, kind),
                body: inner,
            }),
            _ => nodes.push(AstNode::For { info, body: inner }),
        }
        Ok(nodes)
    }
}

fn unwrap_block(node: AstNode) -> Vec<AstNode> {
    match node {
        AstNode::Block(children) => children,
        other => vec![other],
    }
}

fn leaf(item: &ScheduleItem) -> AstNode {
    match &item.kind {
        ItemKind::Statement { index, name } => AstNode::User {
            index: *index,
            name: name.clone(),
        },
        ItemKind::Copy {
            var,
            direction,
            placement,
            refs,
            ..
        } => AstNode::Copy {
            var: var.clone(),
            direction: *direction,
            placement: *placement,
            refs: refs.clone(),
        },
        ItemKind::Sync => AstNode::Sync,
    }
}

/// Name of the block or thread id fixing coordinate `j`
fn mapped_id(sched: &KernelSchedule, j: usize, kind: LevelKind) -> String {
    let offset = match kind {
        LevelKind::BlockId => j - sched.tile_first,
        _ => sched.n_grid + (j - sched.shared_len()),
    };
    sched
        .param_names
        .get(sched.n_program_param + offset)
        .cloned()
        .unwrap_or_default()
}

/// Host code: the host loops of every kernel around its launch.
pub fn build_host(kernels: &[(usize, &KernelSchedule)]) -> AstNode {
    let mut nodes = Vec::with_capacity(kernels.len());
    for &(id, sched) in kernels {
        let mut node = AstNode::Launch { kernel: id };
        for j in (0..sched.tile_first).rev() {
            if sched.is_constant_dim(j) {
                continue;
            }
            node = AstNode::For {
                info: NodeInfo {
                    level: j,
                    kind: LevelKind::Host,
                    unroll: false,
                },
                body: Box::new(node),
            };
        }
        nodes.push(node);
    }
    AstNode::Block(nodes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::KernelContext;
    use crate::config::GpuOptions;
    use crate::group::group_references;
    use crate::placement::{check_unroll, enforce_shared_budget};
    use crate::scop::{Scop, ScopBuilder};
    use crate::sync::{interchange_for_unroll, schedule_body};

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

    /// `for t: for i: B[i] = A[2i]`, band on `i` only
    fn stencil() -> Scop {
        let mut b = ScopBuilder::new();
        b.param("N");
        b.param("M");
        b.context("N >= 2 and M >= 1").unwrap();
        b.array("A", "float", 4, 1);
        b.array("B", "float", 4, 1);
        let s = b
            .statement("S", &["t", "i"], "0 <= t < M and 0 <= i < N - 1", &["t", "i"])
            .unwrap();
        b.read(s, "A", &["2i"]).unwrap();
        b.write(s, "B", &["i"]).unwrap();
        b.region(&[s], 1, 1);
        b.build().unwrap()
    }

    #[test]
    fn test_loop_nest_of_single_statement() {
        let scop = stencil();
        let body = body_of(&scop, &GpuOptions::default());
        let ast = TreeBuilder.build(&body).unwrap();
        let path = ast
            .enclosing(&|n| matches!(n, AstNode::User { .. }))
            .unwrap();
        let kinds: Vec<LevelKind> = path.iter().map(|i| i.kind).collect();
        // the host loop over t is not part of the kernel
        assert_eq!(
            kinds,
            vec![
                LevelKind::BlockId,
                LevelKind::TileLoop,
                LevelKind::ThreadId,
                LevelKind::PointLoop
            ]
        );
        assert!(path.iter().all(|i| !i.unroll));
        assert_eq!(path[0].level, 1);
    }

    #[test]
    fn test_copies_and_barriers_surround_body() {
        let scop = stencil();
        let body = body_of(&scop, &GpuOptions::default());
        let ast = TreeBuilder.build(&body).unwrap();
        let leaves: Vec<String> = ast
            .leaves()
            .iter()
            .map(|n| match n {
                AstNode::User { name, .. } => name.clone(),
                AstNode::Copy { var, direction, .. } => format!("{}:{:?}", var, direction),
                AstNode::Sync => "sync".to_string(),
                other => format!("{:?}", other),
            })
            .collect();
        assert_eq!(leaves, vec!["shared_A:In", "sync", "S", "sync"]);

        // the copy runs inside the tile loop, outside the thread ids
        let path = ast
            .enclosing(&|n| matches!(n, AstNode::Copy { .. }))
            .unwrap();
        let kinds: Vec<LevelKind> = path.iter().map(|i| i.kind).collect();
        assert_eq!(kinds, vec![LevelKind::BlockId, LevelKind::TileLoop]);
    }

    #[test]
    fn test_mapped_ids_and_host_loops() {
        let scop = stencil();
        let body = body_of(&scop, &GpuOptions::default());
        let ast = TreeBuilder.build(&body).unwrap();
        match &ast {
            AstNode::Block(children) => match &children[0] {
                AstNode::Mapped { id, .. } => assert_eq!(id, "b0"),
                other => panic!("unexpected {:?}", other),
            },
            other => panic!("unexpected {:?}", other),
        }

        let host = build_host(&[(0, &body.schedule)]);
        let path = host
            .enclosing(&|n| matches!(n, AstNode::Launch { kernel: 0 }))
            .unwrap();
        assert_eq!(path.len(), 1);
        assert_eq!(path[0].kind, LevelKind::Host);
    }
}
