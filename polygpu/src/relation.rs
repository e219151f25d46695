//! Access relations in schedule space
//!
//! An [`AccessMap`] is the union, over a set of references, of the relations
//! `{ [schedule prefix] -> Array[element] }`. Each reference contributes one
//! [`Piece`]: an integer system over
//!
//! ```text
//! [params | in (schedule prefix) | out (array index) | existentials]
//! ```
//!
//! where the existentials are the statement iterators, the block and thread
//! ids and the divs introduced by tiling. Keeping the iterators existential
//! lets a single system describe an arbitrary quasi-affine relation without
//! computing its explicit form.
//!
//! All predicates are answered by building the joint system of two pieces
//! (sharing the parameters) and asking the engine for emptiness. Emptiness is
//! only ever proven, never assumed, so every predicate errs on the safe side:
//! "overlap", "reuse" and "depends" may be reported spuriously, while
//! "exclusive", "single-valued" and "coalesced" are only reported when proven.

use std::ops::Range;

use crate::error::EngineError;
use crate::poly::{Aff, AffConstraint, ConstraintKind, System};
use crate::scop::{Access, AccessIndex, RefId};
use crate::schedule::StatementSchedule;

/// The relation contributed by one reference
#[derive(Debug, Clone)]
pub struct Piece {
    pub reference: RefId,
    pub system: System,
}

/// Union of per-reference relations from a schedule prefix to array elements
#[derive(Debug, Clone)]
pub struct AccessMap {
    n_param: usize,
    n_in: usize,
    n_out: usize,
    pieces: Vec<Piece>,
}

/// Joint system of two pieces: `[params | in_a | out_a | in_b | out_b | exist_a | exist_b]`
struct Joint {
    sys: System,
    n_param: usize,
    n_in: usize,
    n_out: usize,
}

impl Joint {
    fn new(n_param: usize, n_in: usize, n_out: usize, a: &Piece, b: &Piece) -> Self {
        let head = n_param + n_in + n_out;
        let ex_a = a.system.n_vars() - head;
        let ex_b = b.system.n_vars() - head;
        let total = n_param + 2 * (n_in + n_out) + ex_a + ex_b;
        let tail = n_param + 2 * (n_in + n_out);

        let map_a: Vec<usize> = (0..a.system.n_vars())
            .map(|k| if k < head { k } else { tail + (k - head) })
            .collect();
        let map_b: Vec<usize> = (0..b.system.n_vars())
            .map(|k| {
                if k < n_param {
                    k
                } else if k < head {
                    k + n_in + n_out
                } else {
                    tail + ex_a + (k - head)
                }
            })
            .collect();

        let mut sys = a.system.embed(total, &map_a);
        sys.intersect(&b.system.embed(total, &map_b));
        Joint {
            sys,
            n_param,
            n_in,
            n_out,
        }
    }

    fn in_a(&self, j: usize) -> usize {
        self.n_param + j
    }

    fn out_a(&self, d: usize) -> usize {
        self.n_param + self.n_in + d
    }

    fn in_b(&self, j: usize) -> usize {
        self.n_param + self.n_in + self.n_out + j
    }

    fn out_b(&self, d: usize) -> usize {
        self.n_param + 2 * self.n_in + self.n_out + d
    }

    fn equal_in(&mut self, range: Range<usize>) {
        for j in range {
            let (a, b) = (self.in_a(j), self.in_b(j));
            self.sys.add_equality(&[(b, 1), (a, -1)], 0);
        }
    }

    fn equal_out(&mut self) {
        for d in 0..self.n_out {
            let (a, b) = (self.out_a(d), self.out_b(d));
            self.sys.add_equality(&[(b, 1), (a, -1)], 0);
        }
    }

    /// `b - a >= k`
    fn at_least(sys: &mut System, b: usize, a: usize, k: i64) {
        sys.add_inequality(&[(b, 1), (a, -1)], -k);
    }

    /// Is the joint system extended with lexicographic `in_b[range] > in_a[range]`
    /// non-empty?
    fn lex_greater_possible(&self, range: Range<usize>) -> Result<bool, EngineError> {
        for k in range.clone() {
            let mut trial = self.sys.clone();
            for j in range.start..k {
                trial.add_equality(&[(self.in_b(j), 1), (self.in_a(j), -1)], 0);
            }
            Self::at_least(&mut trial, self.in_b(k), self.in_a(k), 1);
            if !trial.is_empty()? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Can some output coordinate differ?
    fn out_differs_possible(&self) -> Result<bool, EngineError> {
        for d in 0..self.n_out {
            for (x, y) in [(self.out_b(d), self.out_a(d)), (self.out_a(d), self.out_b(d))] {
                let mut trial = self.sys.clone();
                Self::at_least(&mut trial, x, y, 1);
                if !trial.is_empty()? {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }
}

impl AccessMap {
    /// Builds the relation of `items` at schedule depth `depth`.
    ///
    /// # Arguments
    /// * `n_param` - number of parameters shared by all pieces; further
    ///   parameters of the statement spaces (block and thread ids) become
    ///   existentials, so that two pieces may disagree on them
    /// * `context` - constraints on the parameters
    /// * `items` - references with the schedule of their statement
    /// * `depth` - number of schedule coordinates kept as input dimensions
    pub fn build(
        n_param: usize,
        context: &[AffConstraint],
        items: &[(&StatementSchedule, &Access)],
        depth: usize,
    ) -> Result<Self, EngineError> {
        let n_out = items.first().map_or(0, |(_, a)| a.index.len());
        let mut pieces = Vec::with_capacity(items.len());
        for (sched, access) in items {
            if access.index.len() != n_out {
                return Err(EngineError::SpaceMismatch(format!(
                    "reference {} has {} indices, expected {}",
                    access.id,
                    access.index.len(),
                    n_out
                )));
            }
            if sched.space.n_param < n_param || sched.dims.len() < depth {
                return Err(EngineError::SpaceMismatch(format!(
                    "statement {} does not match a {}-parameter schedule of depth {}",
                    sched.stmt, n_param, depth
                )));
            }
            pieces.push(Piece {
                reference: access.id,
                system: Self::piece_system(n_param, context, sched, access, depth)?,
            });
        }
        Ok(AccessMap {
            n_param,
            n_in: depth,
            n_out,
            pieces,
        })
    }

    fn piece_system(
        n_param: usize,
        context: &[AffConstraint],
        sched: &StatementSchedule,
        access: &Access,
        depth: usize,
    ) -> Result<System, EngineError> {
        let n_out = access.index.len();
        let head = n_param + depth + n_out;
        let n_local = sched.space.dim();
        let map: Vec<usize> = (0..n_local)
            .map(|k| if k < n_param { k } else { head + (k - n_param) })
            .collect();

        let mut sys = System::new(head + (n_local - n_param));
        for c in sched
            .constraints
            .iter()
            .chain(sched.space.div_constraints()?.iter())
            .chain(context)
        {
            sys.add_aff(c, &map);
        }
        for (j, dim) in sched.dims.iter().take(depth).enumerate() {
            let expr = dim.remapped(&map).sub(&Aff::var(n_param + j))?;
            sys.add_expr(ConstraintKind::Equality, &expr);
        }
        for (d, index) in access.index.iter().enumerate() {
            let out = Aff::var(n_param + depth + d);
            match index {
                AccessIndex::Affine(aff) => {
                    let expr = sched.lift(aff).remapped(&map).sub(&out)?;
                    sys.add_expr(ConstraintKind::Equality, &expr);
                }
                AccessIndex::Range { lower, upper } => {
                    let lo = sched.lift(lower).remapped(&map);
                    let hi = sched.lift(upper).remapped(&map);
                    sys.add_expr(ConstraintKind::Inequality, &out.sub(&lo)?);
                    sys.add_expr(ConstraintKind::Inequality, &hi.sub(&out)?);
                }
            }
        }
        Ok(sys)
    }

    pub fn n_param(&self) -> usize {
        self.n_param
    }

    pub fn n_in(&self) -> usize {
        self.n_in
    }

    pub fn n_out(&self) -> usize {
        self.n_out
    }

    pub fn pieces(&self) -> &[Piece] {
        &self.pieces
    }

    /// Does the relation provably contain no pair?
    pub fn is_empty(&self) -> Result<bool, EngineError> {
        for piece in &self.pieces {
            if !piece.system.is_empty()? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub fn union(&self, other: &AccessMap) -> Result<AccessMap, EngineError> {
        if (self.n_param, self.n_in, self.n_out) != (other.n_param, other.n_in, other.n_out) {
            return Err(EngineError::SpaceMismatch(
                "union of access maps of different shapes".to_string(),
            ));
        }
        let mut pieces = self.pieces.clone();
        pieces.extend(other.pieces.iter().cloned());
        Ok(AccessMap {
            pieces,
            ..*self
        })
    }

    /// Projection onto output dimension `d`; the other output dimensions
    /// become existentials.
    pub fn select_out(&self, d: usize) -> AccessMap {
        let base = self.n_param + self.n_in;
        let n_out = self.n_out;
        let pieces = self
            .pieces
            .iter()
            .map(|piece| {
                let nv = piece.system.n_vars();
                let map: Vec<usize> = (0..nv)
                    .map(|k| {
                        if k < base {
                            k
                        } else if k < base + n_out {
                            let o = k - base;
                            if o == d {
                                base
                            } else {
                                let rank = if o < d { o } else { o - 1 };
                                nv - (n_out - 1) + rank
                            }
                        } else {
                            base + 1 + (k - base - n_out)
                        }
                    })
                    .collect();
                Piece {
                    reference: piece.reference,
                    system: piece.system.embed(nv, &map),
                }
            })
            .collect();
        AccessMap {
            n_param: self.n_param,
            n_in: self.n_in,
            n_out: 1,
            pieces,
        }
    }

    fn joint(&self, a: &Piece, b: &Piece) -> Joint {
        Joint::new(self.n_param, self.n_in, self.n_out, a, b)
    }

    /// Do the two relations share a pair `(in, out)`?
    pub fn overlaps(&self, other: &AccessMap) -> Result<bool, EngineError> {
        if (self.n_in, self.n_out) != (other.n_in, other.n_out) {
            return Err(EngineError::SpaceMismatch(
                "overlap test of access maps of different shapes".to_string(),
            ));
        }
        for a in &self.pieces {
            for b in &other.pieces {
                let mut j = self.joint(a, b);
                j.equal_in(0..self.n_in);
                j.equal_out();
                if !j.sys.is_empty()? {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Is some element accessed by two different schedule points that agree
    /// on the first `prefix` coordinates (or twice by one point through two
    /// different references)?
    pub fn has_reuse(&self, prefix: usize) -> Result<bool, EngineError> {
        for (i, a) in self.pieces.iter().enumerate() {
            for (k, b) in self.pieces.iter().enumerate() {
                let mut j = self.joint(a, b);
                j.equal_in(0..prefix);
                j.equal_out();
                if j.lex_greater_possible(prefix..self.n_in)? {
                    return Ok(true);
                }
                if i != k {
                    let mut same = j.sys.clone();
                    for q in prefix..self.n_in {
                        same.add_equality(&[(j.in_b(q), 1), (j.in_a(q), -1)], 0);
                    }
                    if !same.is_empty()? {
                        return Ok(true);
                    }
                }
            }
        }
        Ok(false)
    }

    /// Does incrementing input `pos` (all other inputs fixed) increment the
    /// last output dimension by exactly one for every reference?
    ///
    /// Accesses without a thread dimension or to scalars count as coalesced.
    pub fn is_coalesced(&self, pos: Option<usize>) -> Result<bool, EngineError> {
        let pos = match pos {
            Some(p) if self.n_out > 0 && p < self.n_in => p,
            _ => return Ok(true),
        };
        let last = self.n_out - 1;
        for piece in &self.pieces {
            let mut j = self.joint(piece, piece);
            j.equal_in(0..pos);
            j.equal_in(pos + 1..self.n_in);
            let (a, b) = (j.in_a(pos), j.in_b(pos));
            j.sys.add_equality(&[(b, 1), (a, -1)], -1);
            let (oa, ob) = (j.out_a(last), j.out_b(last));

            let mut too_small = j.sys.clone();
            too_small.add_inequality(&[(oa, 1), (ob, -1)], 0);
            let mut too_large = j.sys.clone();
            Joint::at_least(&mut too_large, ob, oa, 2);
            if !too_small.is_empty()? || !too_large.is_empty()? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// For fixed inputs `[0, prefix)`, do distinct values of the inputs in
    /// `threads` always access distinct elements?
    pub fn is_exclusive(&self, prefix: usize, threads: Range<usize>) -> Result<bool, EngineError> {
        for a in &self.pieces {
            for b in &self.pieces {
                let mut j = self.joint(a, b);
                j.equal_in(0..prefix);
                j.equal_out();
                if j.lex_greater_possible(threads.clone())? {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// Does every input map to at most one element?
    pub fn is_single_valued(&self) -> Result<bool, EngineError> {
        for a in &self.pieces {
            for b in &self.pieces {
                let mut j = self.joint(a, b);
                j.equal_in(0..self.n_in);
                if j.out_differs_possible()? {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// Can changing only input `q` change the accessed element of a reference?
    pub fn depends_on(&self, q: usize) -> Result<bool, EngineError> {
        if q >= self.n_in {
            return Ok(false);
        }
        for piece in &self.pieces {
            let mut j = self.joint(piece, piece);
            j.equal_in(0..q);
            j.equal_in(q + 1..self.n_in);
            let (qa, qb) = (j.in_a(q), j.in_b(q));
            Joint::at_least(&mut j.sys, qb, qa, 1);
            if j.out_differs_possible()? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}
