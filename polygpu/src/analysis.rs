//! Per-kernel analysis context
//!
//! [`KernelContext`] is the value threaded through grouping, placement and
//! body scheduling of one kernel. It owns the kernel schedule, indexes the
//! references of the kernel and answers the access predicates every stage
//! needs, building [`AccessMap`]s at whatever schedule depth a question is
//! asked.

use log::trace;

use crate::config::GpuOptions;
use crate::error::{EngineError, GpuError, Result};
use crate::poly::{Aff, ConstraintKind, System};
use crate::relation::AccessMap;
use crate::schedule::KernelSchedule;
use crate::scop::{Access, AccessIndex, ArrayInfo, RefId, Scop};

/// A reference of the kernel together with its statement
#[derive(Debug, Clone, Copy)]
pub struct RefInfo<'a> {
    /// Position in [`KernelSchedule::statements`]
    pub sched_idx: usize,
    pub access: &'a Access,
}

pub struct KernelContext<'a> {
    pub scop: &'a Scop,
    pub options: &'a GpuOptions,
    pub schedule: KernelSchedule,
    /// Ordered by array declaration, then statement, then reference
    refs: Vec<RefInfo<'a>>,
}

impl<'a> KernelContext<'a> {
    pub fn new(scop: &'a Scop, options: &'a GpuOptions, schedule: KernelSchedule) -> Self {
        let mut refs = Vec::new();
        for array in &scop.arrays {
            for (sched_idx, st) in schedule.statements.iter().enumerate() {
                for access in &scop.statements[st.stmt].accesses {
                    if access.array == array.name {
                        refs.push(RefInfo { sched_idx, access });
                    }
                }
            }
        }
        Self {
            scop,
            options,
            schedule,
            refs,
        }
    }

    pub fn references(&self) -> &[RefInfo<'a>] {
        &self.refs
    }

    pub fn reference(&self, id: RefId) -> Option<&RefInfo<'a>> {
        self.refs.iter().find(|r| r.access.id == id)
    }

    /// Position of a reference in declaration order
    pub fn order_of(&self, id: RefId) -> usize {
        self.refs
            .iter()
            .position(|r| r.access.id == id)
            .unwrap_or(usize::MAX)
    }

    /// References of `array` in declaration order
    pub fn references_to(&self, array: &str) -> Vec<RefId> {
        self.refs
            .iter()
            .filter(|r| r.access.array == array)
            .map(|r| r.access.id)
            .collect()
    }

    pub fn array(&self, name: &str) -> Result<&'a ArrayInfo> {
        self.scop
            .array(name)
            .ok_or_else(|| GpuError::InvalidProgram(format!("unknown array '{}'", name)))
    }

    /// Union of the relations of `refs` at schedule depth `depth`
    pub fn access_map(&self, refs: &[RefId], depth: usize) -> Result<AccessMap, EngineError> {
        let mut items = Vec::with_capacity(refs.len());
        for &id in refs {
            let info = self
                .reference(id)
                .ok_or_else(|| EngineError::SpaceMismatch(format!("reference {} not in kernel", id)))?;
            items.push((&self.schedule.statements[info.sched_idx], info.access));
        }
        AccessMap::build(
            self.schedule.n_program_param,
            &self.schedule.context,
            &items,
            depth,
        )
    }

    /// `depth` without trailing coordinates that are constant in every statement
    pub fn effective_depth(&self, depth: usize) -> usize {
        let mut d = depth;
        while d > 0 && self.schedule.is_constant_dim(d - 1) {
            d -= 1;
        }
        d
    }

    /// Schedule position of the innermost thread id
    pub fn last_thread_pos(&self) -> Option<usize> {
        (self.schedule.n_block > 0).then(|| self.schedule.private_len() - 1)
    }

    /// Is some element accessed more than once within one shared-level
    /// iteration?
    pub fn has_reuse(&self, refs: &[RefId]) -> Result<bool> {
        let map = self.access_map(refs, self.schedule.depth())?;
        Ok(map.has_reuse(self.schedule.shared_len())?)
    }

    /// Do adjacent threads access adjacent elements?
    pub fn is_coalesced(&self, refs: &[RefId]) -> Result<bool> {
        let depth = self.schedule.private_len() + self.schedule.tile_len;
        let map = self.access_map(refs, depth)?;
        Ok(map.is_coalesced(self.last_thread_pos())?)
    }

    /// For fixed shared-level coordinates, is the access a bijection between
    /// thread identities and elements (one element per thread and point)?
    pub fn is_bijective(&self, refs: &[RefId]) -> Result<bool> {
        let shared = self.schedule.shared_len();
        let private = self.schedule.private_len();
        let map = self.access_map(refs, private)?;
        if !map.is_exclusive(shared, shared..private)? {
            trace!("references {:?} are shared between threads", refs);
            return Ok(false);
        }
        let points = self.access_map(refs, private + self.schedule.tile_len)?;
        Ok(points.is_single_valued()?)
    }

    /// Can moving only schedule coordinate `pos` change an accessed element?
    pub fn depends_on(&self, refs: &[RefId], pos: usize) -> Result<bool> {
        let map = self.access_map(refs, self.schedule.depth())?;
        Ok(map.depends_on(pos)?)
    }

    /// Does the exact write `write` produce, earlier in the same iteration of
    /// every loop above `level`, the element `read` consumes?
    ///
    /// Both statements must have the same iterators; the read domain must be
    /// contained in the write domain, both references must address the same
    /// element and the first schedule coordinate on which the statements
    /// differ must be a post-band coordinate ordering the write first.
    pub fn is_covered_in_granule(&self, read: RefId, write: RefId, level: usize) -> Result<bool> {
        let (r, w) = match (self.reference(read), self.reference(write)) {
            (Some(r), Some(w)) => (*r, *w),
            _ => return Ok(false),
        };
        if !w.access.is_write() || !w.access.exact {
            return Ok(false);
        }
        let rs = &self.scop.statements[self.schedule.statements[r.sched_idx].stmt];
        let ws = &self.scop.statements[self.schedule.statements[w.sched_idx].stmt];
        if rs.iterators.len() != ws.iterators.len() {
            return Ok(false);
        }

        let n = self.scop.n_param() + rs.iterators.len();
        let identity: Vec<usize> = (0..n).collect();
        let mut read_domain = System::new(n);
        for c in rs.domain.iter().chain(&self.scop.context) {
            read_domain.add_aff(c, &identity);
        }
        let mut write_domain = System::new(n);
        for c in &ws.domain {
            write_domain.add_aff(c, &identity);
        }
        if !read_domain.is_subset_of(&write_domain)? {
            return Ok(false);
        }

        for (ri, wi) in r.access.index.iter().zip(&w.access.index) {
            match (ri, wi) {
                (AccessIndex::Affine(a), AccessIndex::Affine(b)) => {
                    if !is_zero_on(&read_domain, &a.sub(b)?)? {
                        return Ok(false);
                    }
                }
                _ => return Ok(false),
            }
        }

        let sched = &self.schedule;
        let band_end = sched.tile_first + sched.tile_len;
        for k in 0..rs.schedule.len() {
            let diff = ws.schedule[k].sub(&rs.schedule[k])?;
            if is_zero_on(&read_domain, &diff)? {
                continue;
            }
            if k < band_end {
                return Ok(false);
            }
            let kernel_pos = k + sched.n_grid + sched.tile_len + sched.n_block;
            if kernel_pos < level {
                return Ok(false);
            }
            // write strictly first: diff >= 0 must be impossible
            let mut later = read_domain.clone();
            later.add_expr(ConstraintKind::Inequality, &diff);
            return Ok(later.is_empty()?);
        }
        Ok(false)
    }
}

/// Is `expr` provably zero on `domain`?
fn is_zero_on(domain: &System, expr: &Aff) -> std::result::Result<bool, EngineError> {
    for sign in [1, -1] {
        let mut trial = domain.clone();
        trial.add_expr(
            ConstraintKind::Inequality,
            &expr.scale(sign)?.add_constant(-1)?,
        );
        if !trial.is_empty()? {
            return Ok(false);
        }
    }
    Ok(true)
}
