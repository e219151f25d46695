//! Bound and stride inference
//!
//! Given the relation from a schedule prefix (`outer`) to a single array
//! index `x`, derive
//! - an optional stride `g` and shift `s(outer)` with `x + s ≡ 0 (mod g)`;
//! - a lower bound `ceil(b(outer)/m)` on `(x + s)/g` (or `x` without stride);
//! - a constant size such that every accessed index lies in
//!   `[lower, lower + size - 1]` for every value of `outer`.
//!
//! # Algorithm
//!
//! Per basic relation ([`Piece`](crate::relation::Piece)):
//! 1. implicit equalities are made explicit and existentials with a single
//!    possible value are fixed;
//! 2. existentials defined by an equality not involving `x` are substituted;
//! 3. equalities `x + s(outer) + Σ g_k e_k = 0` reveal the stride
//!    `g = gcd(g_k)`, the largest one wins;
//! 4. after substituting `x = g·y - s`, the existentials are projected out and
//!    every lower bound `m·y + r(outer) >= 0` is a candidate whose size is the
//!    maximum of `y - ceil(-r/m) + 1`.
//!
//! For a union of pieces every candidate must bound every piece, the size is
//! the largest over the pieces, and a stride survives only if all pieces agree
//! on it and on the shift modulo the stride. The smallest finite size wins.

use log::{debug, trace};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::poly::{ceil_div, gcd, Aff, ConstraintKind, Optimum, System};
use crate::relation::AccessMap;

/// `ceil(aff / denom)` over `[params | outer]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LowerBound {
    pub aff: Aff,
    pub denom: i64,
}

impl LowerBound {
    pub fn eval(&self, outer: &[i64]) -> Result<i64, EngineError> {
        Ok(ceil_div(self.aff.eval(outer)?, self.denom))
    }

    /// Does the bound depend on any variable in `[start, end)`?
    pub fn involves_range(&self, start: usize, end: usize) -> bool {
        self.aff.involves_range(start, end)
    }
}

/// `index + shift ≡ 0 (mod stride)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stride {
    pub stride: i64,
    /// Over `[params | outer]`
    pub shift: Aff,
}

/// Finite extent of one array dimension of a tile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bound {
    pub size: i64,
    /// Lower bound of the (stride-corrected) index
    pub lower: LowerBound,
    pub stride: Option<Stride>,
}

impl Bound {
    /// Stride-corrected index `(index + shift) / stride`, `None` if `index`
    /// is not on the stride lattice
    pub fn scaled_index(&self, outer: &[i64], index: i64) -> Result<Option<i64>, EngineError> {
        match &self.stride {
            None => Ok(Some(index)),
            Some(s) => {
                let shifted = index
                    .checked_add(s.shift.eval(outer)?)
                    .ok_or(EngineError::Overflow)?;
                Ok((shifted % s.stride == 0).then(|| shifted / s.stride))
            }
        }
    }
}

/// Parametric bounds of one array dimension, over the parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimExtent {
    pub lower: Option<Aff>,
    pub upper: Option<Aff>,
}

impl DimExtent {
    /// `upper - lower + 1` when both bounds are known
    pub fn size(&self) -> Result<Option<Aff>, EngineError> {
        match (&self.lower, &self.upper) {
            (Some(lo), Some(hi)) => Ok(Some(hi.sub(lo)?.add_constant(1)?)),
            _ => Ok(None),
        }
    }
}

/// A lower-bound candidate `m·x + rest >= 0`
#[derive(Debug, Clone, PartialEq)]
struct Candidate {
    m: i64,
    rest: Aff,
}

/// Infers the bound of the single output dimension of `map`.
///
/// # Returns
/// * `Ok(Some(bound))` - a finite bound valid for every piece
/// * `Ok(None)` - no finite bound could be proven (not an error)
///
/// # Errors
/// Algebra engine failures only.
pub fn infer_bound(map: &AccessMap) -> Result<Option<Bound>, EngineError> {
    if map.n_out() != 1 {
        return Err(EngineError::SpaceMismatch(format!(
            "bound inference on {} output dimensions",
            map.n_out()
        )));
    }
    let x = map.n_param() + map.n_in();

    let mut systems = Vec::with_capacity(map.pieces().len());
    for piece in map.pieces() {
        let mut sys = piece.system.clone();
        if sys.is_empty()? {
            continue;
        }
        sys.detect_equalities()?;
        sys.fix_determined(x + 1..sys.n_vars())?;
        substitute_defined(&mut sys, x)?;
        systems.push(sys);
    }
    if systems.is_empty() {
        trace!("bound inference on an empty relation");
        return Ok(None);
    }

    let stride = common_stride(&systems, x)?;
    let mut projected = Vec::with_capacity(systems.len());
    for sys in systems {
        let sys = match &stride {
            Some(s) => apply_stride(&sys, x, s)?,
            None => sys,
        };
        let existentials: Vec<usize> = (x + 1..sys.n_vars()).collect();
        projected.push(sys.project_out(&existentials)?);
    }

    let mut candidates: Vec<Candidate> = Vec::new();
    for sys in &projected {
        for c in sys.constraints() {
            let m = c.coeff(x);
            if m == 0 || (c.kind == ConstraintKind::Inequality && m < 0) {
                continue;
            }
            // equalities are normalized with a positive leading coefficient
            let (m, sign) = if m > 0 { (m, 1) } else { (-m, -1) };
            let mut rest = c.to_aff().scale(sign)?;
            rest.set_coeff(x, 0);
            let cand = Candidate { m, rest };
            if !candidates.contains(&cand) {
                candidates.push(cand);
            }
        }
    }

    let mut best: Option<(i64, &Candidate)> = None;
    for cand in &candidates {
        if !is_valid_lower_bound(&projected, x, cand)? {
            continue;
        }
        if let Some(size) = candidate_size(&projected, x, cand)? {
            trace!("candidate {}·x + {} >= 0 has size {}", cand.m, cand.rest, size);
            if best.map_or(true, |(s, _)| size < s) {
                best = Some((size, cand));
            }
        }
    }

    let bound = match best {
        Some((size, cand)) => Some(Bound {
            size,
            lower: LowerBound {
                aff: cand.rest.scale(-1)?.truncated(x),
                denom: cand.m,
            },
            stride: stride.clone(),
        }),
        None => None,
    };
    if bound.is_none() {
        debug!("no finite bound among {} candidates", candidates.len());
    }
    Ok(bound)
}

/// Substitutes existentials defined by an equality that does not involve
/// `x`: either with a unit coefficient, or in terms of non-existentials only.
fn substitute_defined(sys: &mut System, x: usize) -> Result<(), EngineError> {
    loop {
        let n = sys.n_vars();
        let mut found = None;
        for e in x + 1..n {
            let pos = sys.find_equality(e, |c| {
                c.coeff(x) == 0
                    && (c.coeff(e).abs() == 1 || (x + 1..n).all(|k| k == e || c.coeff(k) == 0))
            });
            if let Some(pos) = pos {
                found = Some((e, pos));
                break;
            }
        }
        match found {
            Some((e, pos)) => sys.eliminate_with_equality(e, pos)?,
            None => return Ok(()),
        }
    }
}

/// Largest stride revealed by an equality of one piece: `(g, shift)` with
/// every coefficient of the shift reduced modulo `g`
fn piece_stride(sys: &System, x: usize) -> Result<Option<(i64, Aff)>, EngineError> {
    let mut best: Option<(i64, Aff)> = None;
    for c in sys.constraints() {
        let a = c.coeff(x);
        if c.kind != ConstraintKind::Equality || a.abs() != 1 {
            continue;
        }
        let g = (x + 1..c.coeffs.len()).fold(0, |g, k| gcd(g, c.coeff(k)));
        if g <= 1 {
            continue;
        }
        let mut shift = c.to_aff().scale(a)?.truncated(x);
        for coeff in &mut shift.coeffs {
            *coeff = coeff.rem_euclid(g);
        }
        shift.constant = shift.constant.rem_euclid(g);
        if best.as_ref().map_or(true, |(bg, _)| g > *bg) {
            best = Some((g, shift));
        }
    }
    Ok(best)
}

fn common_stride(systems: &[System], x: usize) -> Result<Option<Stride>, EngineError> {
    let mut common: Option<(i64, Aff)> = None;
    for sys in systems {
        let this = match piece_stride(sys, x)? {
            Some(this) => this,
            None => return Ok(None),
        };
        match &common {
            None => common = Some(this),
            Some(c) if *c == this => {}
            Some(_) => return Ok(None),
        }
    }
    Ok(common.map(|(stride, shift)| Stride { stride, shift }))
}

/// Replaces `x` by `y = (x + shift)/stride` in place
fn apply_stride(sys: &System, x: usize, stride: &Stride) -> Result<System, EngineError> {
    let mut sys = sys.clone();
    let y = sys.add_vars(1).start;
    let expr = Aff::var(x)
        .add(&stride.shift)?
        .sub(&Aff::term(y, stride.stride))?;
    sys.add_expr(ConstraintKind::Equality, &expr);
    let sys = sys.project_out(&[x])?;
    let n = sys.n_vars();
    let swap: Vec<usize> = (0..n)
        .map(|k| {
            if k == x {
                y
            } else if k == y {
                x
            } else {
                k
            }
        })
        .collect();
    Ok(sys.embed(n, &swap))
}

/// `m·x + rest >= 0` holds on every piece
fn is_valid_lower_bound(systems: &[System], x: usize, cand: &Candidate) -> Result<bool, EngineError> {
    let violated = Aff::term(x, -cand.m).sub(&cand.rest)?.add_constant(-1)?;
    for sys in systems {
        let mut trial = sys.clone();
        trial.add_expr(ConstraintKind::Inequality, &violated);
        if !trial.is_empty()? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Maximum over all pieces of `x - ceil(-rest/m) + 1`, `None` if unbounded
fn candidate_size(systems: &[System], x: usize, cand: &Candidate) -> Result<Option<i64>, EngineError> {
    let mut size: Option<i64> = None;
    for sys in systems {
        let mut sys = sys.clone();
        let objective = if cand.m == 1 {
            Aff::var(x).add(&cand.rest)?.add_constant(1)?
        } else {
            // q = ceil(-rest/m): m·q + rest >= 0 and -m·q - rest + m - 1 >= 0
            let q = sys.add_vars(1).start;
            let mq = Aff::term(q, cand.m);
            let lower = mq.add(&cand.rest)?;
            sys.add_expr(ConstraintKind::Inequality, &lower);
            sys.add_expr(
                ConstraintKind::Inequality,
                &lower.scale(-1)?.add_constant(cand.m - 1)?,
            );
            Aff::var(x).sub(&Aff::var(q))?.add_constant(1)?
        };
        match sys.maximize(&objective)? {
            Optimum::Value(v) => size = Some(size.map_or(v, |s| s.max(v))),
            Optimum::Unbounded => return Ok(None),
            Optimum::Empty => {}
        }
    }
    Ok(size)
}

/// Parametric extent of every output dimension of `map` (an access relation
/// with no input dimensions).
///
/// Only unit-coefficient bounds valid for every piece are reported.
pub fn infer_extent(map: &AccessMap) -> Result<Vec<DimExtent>, EngineError> {
    let x = map.n_param() + map.n_in();
    let mut dims = Vec::with_capacity(map.n_out());
    for d in 0..map.n_out() {
        let sel = map.select_out(d);
        let mut projected = Vec::new();
        for piece in sel.pieces() {
            let existentials: Vec<usize> = (x + 1..piece.system.n_vars()).collect();
            let proj = piece.system.project_out(&existentials)?;
            if !proj.is_empty()? {
                projected.push(proj);
            }
        }
        dims.push(DimExtent {
            lower: extent_side(&projected, x, 1)?,
            upper: extent_side(&projected, x, -1)?,
        });
    }
    Ok(dims)
}

/// First bound `sign·x + rest >= 0` valid for all pieces, as `x >= -rest`
/// (`sign = 1`) or `x <= rest` (`sign = -1`)
fn extent_side(systems: &[System], x: usize, sign: i64) -> Result<Option<Aff>, EngineError> {
    if systems.is_empty() {
        return Ok(None);
    }
    for sys in systems {
        for c in sys.constraints() {
            let a = c.coeff(x);
            let usable = match c.kind {
                ConstraintKind::Inequality => a == sign,
                ConstraintKind::Equality => a.abs() == 1,
            };
            if !usable {
                continue;
            }
            let mut rest = c
                .to_aff()
                .scale(if c.kind == ConstraintKind::Equality { a * sign } else { 1 })?;
            rest.set_coeff(x, 0);
            // violation: sign·x + rest <= -1
            let violated = Aff::term(x, -sign).sub(&rest)?.add_constant(-1)?;
            let mut valid = true;
            for other in systems {
                let mut trial = other.clone();
                trial.add_expr(ConstraintKind::Inequality, &violated);
                if !trial.is_empty()? {
                    valid = false;
                    break;
                }
            }
            if valid {
                return Ok(Some(rest.scale(-sign)?.truncated(x)));
            }
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scop::{Scop, ScopBuilder};
    use crate::schedule::StatementSchedule;

    /// Relation of every reference in `scop` at depth 0
    fn extent_map(scop: &Scop) -> AccessMap {
        let scheds: Vec<StatementSchedule> = (0..scop.statements.len())
            .map(|s| StatementSchedule::untiled(scop, s))
            .collect();
        let items: Vec<_> = scop
            .statements
            .iter()
            .enumerate()
            .flat_map(|(s, st)| st.accesses.iter().map(move |a| (s, a)))
            .map(|(s, a)| (&scheds[s], a))
            .collect();
        AccessMap::build(scop.n_param(), &scop.context, &items, 0).unwrap()
    }

    fn one_statement(domain: &str, index: &[&str]) -> Scop {
        let mut b = ScopBuilder::new();
        b.param("N");
        b.context("N >= 1").unwrap();
        b.array("A", "float", 4, 1);
        let s = b.statement("S0", &["i"], domain, &["i"]).unwrap();
        for idx in index {
            b.read(s, "A", &[idx]).unwrap();
        }
        b.region(&[s], 0, 1);
        b.build().unwrap()
    }

    #[test]
    fn test_constant_range() {
        let scop = one_statement("0 <= i <= 9", &["i + 3"]);
        let bound = infer_bound(&extent_map(&scop)).unwrap().unwrap();
        assert_eq!(bound.size, 10);
        assert_eq!(bound.lower.eval(&[100]), Ok(3));
        assert!(bound.stride.is_none());
    }

    #[test]
    fn test_stride_detection() {
        let scop = one_statement("0 <= i <= 63", &["2*i"]);
        let bound = infer_bound(&extent_map(&scop)).unwrap().unwrap();
        let stride = bound.stride.clone().unwrap();
        assert_eq!(stride.stride, 2);
        assert_eq!(stride.shift, Aff::constant(0));
        assert_eq!(bound.size, 64);
        assert_eq!(bound.lower.eval(&[1]), Ok(0));
        assert_eq!(bound.scaled_index(&[1], 10), Ok(Some(5)));
        assert_eq!(bound.scaled_index(&[1], 11), Ok(None));
    }

    #[test]
    fn test_stride_disagreement_drops_stride() {
        // 2i and 2i + 1 together cover every index
        let scop = one_statement("0 <= i <= 9", &["2*i", "2*i + 1"]);
        let bound = infer_bound(&extent_map(&scop)).unwrap().unwrap();
        assert!(bound.stride.is_none());
        assert_eq!(bound.size, 20);
    }

    #[test]
    fn test_parametric_range_has_no_bound() {
        let scop = one_statement("0 <= i < N", &["i"]);
        assert!(infer_bound(&extent_map(&scop)).unwrap().is_none());
    }

    #[test]
    fn test_extent_of_parametric_range() {
        let scop = one_statement("0 <= i < N", &["i", "i + 2"]);
        let dims = infer_extent(&extent_map(&scop)).unwrap();
        assert_eq!(dims[0].lower, Some(Aff::constant(0)));
        assert_eq!(dims[0].upper, Some(Aff::var(0).add_constant(1).unwrap()));
        assert_eq!(dims[0].size(), Ok(Some(Aff::var(0).add_constant(2).unwrap())));
    }
}
