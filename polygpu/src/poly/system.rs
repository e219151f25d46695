//! Integer constraint systems and Fourier–Motzkin elimination
//!
//! A [`System`] is a conjunction of affine equalities and inequalities over a
//! flat vector of integer variables. The meaning of each variable (parameter,
//! schedule coordinate, array index, existential) is decided by whoever builds
//! the system; the engine only knows indices.
//!
//! # Exactness
//!
//! Variables are eliminated with Fourier–Motzkin over the rationals, but every
//! derived constraint is tightened with the integer rounding rule
//! `Σ a_i x_i + c >= 0  ⇒  Σ (a_i/g) x_i + floor(c/g) >= 0` (`g = gcd(a_i)`) and
//! equalities are checked for divisibility. This gives:
//! - [`System::is_empty`] returns `true` only for sets that are provably empty;
//! - [`System::maximize`] returns an upper bound of the integer maximum that is
//!   exact whenever every elimination step involves a unit coefficient, which
//!   covers the systems produced by tiling.

use log::trace;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::ops::Range;

use super::aff::{floor_div, gcd, Aff, AffConstraint};
use crate::error::EngineError;

/// Upper limit on the number of constraints kept during elimination
const MAX_CONSTRAINTS: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConstraintKind {
    /// `expr = 0`
    Equality,
    /// `expr >= 0`
    Inequality,
}

/// `coeffs · x + constant (= | >=) 0`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Constraint {
    pub kind: ConstraintKind,
    pub coeffs: Vec<i64>,
    pub constant: i64,
}

impl Constraint {
    pub fn equality(coeffs: Vec<i64>, constant: i64) -> Self {
        Self {
            kind: ConstraintKind::Equality,
            coeffs,
            constant,
        }
    }

    pub fn inequality(coeffs: Vec<i64>, constant: i64) -> Self {
        Self {
            kind: ConstraintKind::Inequality,
            coeffs,
            constant,
        }
    }

    /// Builds a constraint from `(variable, coefficient)` terms
    pub fn from_terms(kind: ConstraintKind, terms: &[(usize, i64)], constant: i64) -> Self {
        let n = terms.iter().map(|&(v, _)| v + 1).max().unwrap_or(0);
        let mut coeffs = vec![0; n];
        for &(v, c) in terms {
            coeffs[v] += c;
        }
        Self {
            kind,
            coeffs,
            constant,
        }
    }

    /// Lowers an affine constraint whose variable `i` lives at system index `map[i]`
    pub fn from_aff(kind: ConstraintKind, aff: &Aff, map: &[usize]) -> Self {
        let terms: Vec<(usize, i64)> = aff
            .coeffs
            .iter()
            .enumerate()
            .filter(|&(_, &c)| c != 0)
            .map(|(i, &c)| (map[i], c))
            .collect();
        Self::from_terms(kind, &terms, aff.constant)
    }

    pub fn coeff(&self, var: usize) -> i64 {
        self.coeffs.get(var).copied().unwrap_or(0)
    }

    pub fn is_constant(&self) -> bool {
        self.coeffs.iter().all(|&c| c == 0)
    }

    /// The constraint as an affine expression over the system variables
    pub fn to_aff(&self) -> Aff {
        Aff {
            coeffs: self.coeffs.clone(),
            constant: self.constant,
        }
    }

    /// Disjuncts of the complement: `¬(e >= 0)` is `-e - 1 >= 0`,
    /// `¬(e = 0)` is `e - 1 >= 0 ∨ -e - 1 >= 0`.
    pub fn negated(&self) -> Result<Vec<Constraint>, EngineError> {
        let neg = negate(&self.coeffs)?;
        let below = self
            .constant
            .checked_neg()
            .and_then(|c| c.checked_sub(1))
            .ok_or(EngineError::Overflow)?;
        Ok(match self.kind {
            ConstraintKind::Inequality => vec![Constraint::inequality(neg, below)],
            ConstraintKind::Equality => vec![
                Constraint::inequality(
                    self.coeffs.clone(),
                    self.constant.checked_sub(1).ok_or(EngineError::Overflow)?,
                ),
                Constraint::inequality(neg, below),
            ],
        })
    }

    /// Divides by the gcd of the coefficients, rounding the constant of an
    /// inequality down. Returns `false` if the constraint has no integer
    /// solution.
    fn normalize(&mut self) -> bool {
        let g = self.coeffs.iter().fold(0, |g, &c| gcd(g, c));
        if g == 0 {
            return match self.kind {
                ConstraintKind::Equality => self.constant == 0,
                ConstraintKind::Inequality => self.constant >= 0,
            };
        }
        match self.kind {
            ConstraintKind::Equality => {
                if self.constant % g != 0 {
                    return false;
                }
                let sign = self
                    .coeffs
                    .iter()
                    .find(|&&c| c != 0)
                    .map_or(1, |c| c.signum());
                for c in &mut self.coeffs {
                    *c = *c / g * sign;
                }
                self.constant = self.constant / g * sign;
            }
            ConstraintKind::Inequality => {
                for c in &mut self.coeffs {
                    *c /= g;
                }
                self.constant = floor_div(self.constant, g);
            }
        }
        true
    }
}

/// `k1 · c1 + k2 · c2`, keeping the kind of `c1`
fn combine(
    c1: &Constraint,
    k1: i64,
    c2: &Constraint,
    k2: i64,
) -> Result<Constraint, EngineError> {
    let n = c1.coeffs.len().max(c2.coeffs.len());
    let lin = |a: i64, b: i64| -> Result<i64, EngineError> {
        a.checked_mul(k1)
            .zip(b.checked_mul(k2))
            .and_then(|(x, y)| x.checked_add(y))
            .ok_or(EngineError::Overflow)
    };
    let mut coeffs = Vec::with_capacity(n);
    for i in 0..n {
        coeffs.push(lin(c1.coeff(i), c2.coeff(i))?);
    }
    Ok(Constraint {
        kind: c1.kind,
        coeffs,
        constant: lin(c1.constant, c2.constant)?,
    })
}

fn negate(coeffs: &[i64]) -> Result<Vec<i64>, EngineError> {
    coeffs
        .iter()
        .map(|c| c.checked_neg().ok_or(EngineError::Overflow))
        .collect()
}

/// Result of an optimization query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Optimum {
    Value(i64),
    Unbounded,
    Empty,
}

impl Optimum {
    pub fn value(self) -> Option<i64> {
        match self {
            Optimum::Value(v) => Some(v),
            _ => None,
        }
    }
}

/// Conjunction of integer constraints over `n_vars` variables
#[derive(Debug, Clone, Default)]
pub struct System {
    n_vars: usize,
    constraints: Vec<Constraint>,
    infeasible: bool,
}

impl System {
    pub fn new(n_vars: usize) -> Self {
        Self {
            n_vars,
            constraints: Vec::new(),
            infeasible: false,
        }
    }

    pub fn n_vars(&self) -> usize {
        self.n_vars
    }

    pub fn constraints(&self) -> &[Constraint] {
        &self.constraints
    }

    /// Whether a contradiction has already been derived
    pub fn is_known_infeasible(&self) -> bool {
        self.infeasible
    }

    /// Appends `n` fresh unconstrained variables and returns their indices
    pub fn add_vars(&mut self, n: usize) -> Range<usize> {
        let start = self.n_vars;
        self.n_vars += n;
        for c in &mut self.constraints {
            c.coeffs.resize(self.n_vars, 0);
        }
        start..self.n_vars
    }

    pub fn add(&mut self, mut constraint: Constraint) {
        if constraint.coeffs.len() > self.n_vars {
            let extra = constraint.coeffs.len() - self.n_vars;
            self.add_vars(extra);
        }
        constraint.coeffs.resize(self.n_vars, 0);
        if !constraint.normalize() {
            self.infeasible = true;
            return;
        }
        if constraint.is_constant() {
            return;
        }
        if !self.constraints.contains(&constraint) {
            self.constraints.push(constraint);
        }
    }

    pub fn add_equality(&mut self, terms: &[(usize, i64)], constant: i64) {
        self.add(Constraint::from_terms(
            ConstraintKind::Equality,
            terms,
            constant,
        ));
    }

    pub fn add_inequality(&mut self, terms: &[(usize, i64)], constant: i64) {
        self.add(Constraint::from_terms(
            ConstraintKind::Inequality,
            terms,
            constant,
        ));
    }

    /// Adds an affine constraint whose variable `i` lives at index `map[i]`
    pub fn add_aff(&mut self, constraint: &AffConstraint, map: &[usize]) {
        self.add(Constraint::from_aff(constraint.kind, &constraint.aff, map));
    }

    /// Adds `expr = 0` or `expr >= 0` for an expression over the system variables
    pub fn add_expr(&mut self, kind: ConstraintKind, expr: &Aff) {
        self.add(Constraint {
            kind,
            coeffs: expr.coeffs.clone(),
            constant: expr.constant,
        });
    }

    pub fn intersect(&mut self, other: &System) {
        if other.infeasible {
            self.infeasible = true;
        }
        for c in &other.constraints {
            self.add(c.clone());
        }
    }

    /// Copies the system into a space of `n_vars` variables, moving
    /// variable `i` to `map[i]`.
    pub fn embed(&self, n_vars: usize, map: &[usize]) -> System {
        let mut out = System::new(n_vars);
        out.infeasible = self.infeasible;
        for c in &self.constraints {
            let mut coeffs = vec![0; n_vars];
            for (i, &a) in c.coeffs.iter().enumerate() {
                if a != 0 {
                    coeffs[map[i]] += a;
                }
            }
            out.add(Constraint {
                kind: c.kind,
                coeffs,
                constant: c.constant,
            });
        }
        out
    }

    pub fn involves(&self, var: usize) -> bool {
        self.constraints.iter().any(|c| c.coeff(var) != 0)
    }

    /// Existentially quantifies `vars`. Variable numbering is preserved; the
    /// eliminated variables simply no longer appear.
    pub fn project_out(&self, vars: &[usize]) -> Result<System, EngineError> {
        let mut sys = self.clone();
        sys.simplify()?;
        let mut remaining: Vec<usize> = vars.to_vec();
        loop {
            if sys.infeasible {
                sys.constraints.clear();
                break;
            }
            remaining.retain(|&v| sys.involves(v));
            let pick = remaining
                .iter()
                .copied()
                .min_by_key(|&v| (sys.elimination_cost(v), v));
            match pick {
                Some(v) => sys.eliminate(v)?,
                None => break,
            }
        }
        Ok(sys)
    }

    /// `true` only if the set provably contains no integer point
    pub fn is_empty(&self) -> Result<bool, EngineError> {
        if self.infeasible {
            return Ok(true);
        }
        let all: Vec<usize> = (0..self.n_vars).collect();
        Ok(self.project_out(&all)?.infeasible)
    }

    /// Upper bound on `objective` (an affine expression of the system
    /// variables) over the set.
    pub fn maximize(&self, objective: &Aff) -> Result<Optimum, EngineError> {
        if self.infeasible {
            return Ok(Optimum::Empty);
        }
        let mut sys = self.clone();
        let t = sys.add_vars(1).start;
        let mut coeffs = vec![0; sys.n_vars];
        for (i, c) in coeffs.iter_mut().enumerate().take(t) {
            *c = objective.coeff(i).checked_neg().ok_or(EngineError::Overflow)?;
        }
        coeffs[t] = 1;
        let constant = objective.constant.checked_neg().ok_or(EngineError::Overflow)?;
        sys.add(Constraint::equality(coeffs, constant));
        let others: Vec<usize> = (0..t).collect();
        let proj = sys.project_out(&others)?;
        if proj.infeasible {
            return Ok(Optimum::Empty);
        }
        let mut best: Option<i64> = None;
        for c in &proj.constraints {
            let a = c.coeff(t);
            let bound = match c.kind {
                ConstraintKind::Equality if a != 0 => {
                    let num = c.constant.checked_neg().ok_or(EngineError::Overflow)?;
                    Some(floor_div(num, a))
                }
                ConstraintKind::Inequality if a < 0 => {
                    let den = a.checked_neg().ok_or(EngineError::Overflow)?;
                    Some(floor_div(c.constant, den))
                }
                _ => None,
            };
            if let Some(b) = bound {
                best = Some(best.map_or(b, |cur| cur.min(b)));
            }
        }
        Ok(best.map_or(Optimum::Unbounded, Optimum::Value))
    }

    /// Lower bound on `objective` over the set
    pub fn minimize(&self, objective: &Aff) -> Result<Optimum, EngineError> {
        Ok(match self.maximize(&objective.scale(-1)?)? {
            Optimum::Value(v) => Optimum::Value(v.checked_neg().ok_or(EngineError::Overflow)?),
            other => other,
        })
    }

    /// Turns inequalities that are tight on the whole set into equalities
    pub fn detect_equalities(&mut self) -> Result<(), EngineError> {
        self.simplify()?;
        let mut i = 0;
        while i < self.constraints.len() && !self.infeasible {
            if self.constraints[i].kind == ConstraintKind::Inequality {
                let expr = self.constraints[i].to_aff();
                match self.maximize(&expr)? {
                    Optimum::Value(v) if v <= 0 => {
                        trace!("implicit equality detected: {}", expr);
                        if v < 0 {
                            self.infeasible = true;
                        } else {
                            self.constraints[i].kind = ConstraintKind::Equality;
                            let mut c = self.constraints.swap_remove(i);
                            if !c.normalize() {
                                self.infeasible = true;
                            }
                            self.constraints.push(c);
                            continue;
                        }
                    }
                    Optimum::Empty => self.infeasible = true,
                    _ => {}
                }
            }
            i += 1;
        }
        self.simplify()
    }

    /// Adds `v = c` for every variable in `vars` whose integer range is the
    /// single value `c`.
    pub fn fix_determined(&mut self, vars: Range<usize>) -> Result<(), EngineError> {
        for v in vars {
            if self.infeasible {
                break;
            }
            if !self.involves(v) {
                continue;
            }
            let var = Aff::var(v);
            let hi = self.maximize(&var)?;
            let lo = self.minimize(&var)?;
            match (lo, hi) {
                (Optimum::Value(l), Optimum::Value(h)) if l == h => {
                    self.add_equality(&[(v, 1)], -l);
                }
                (Optimum::Value(l), Optimum::Value(h)) if l > h => self.infeasible = true,
                (Optimum::Empty, _) | (_, Optimum::Empty) => self.infeasible = true,
                _ => {}
            }
        }
        self.simplify()
    }

    /// `self ⊆ other` for an `other` without existentially quantified
    /// variables. A `true` answer is a proof.
    pub fn is_subset_of(&self, other: &System) -> Result<bool, EngineError> {
        if other.infeasible {
            return self.is_empty();
        }
        for c in &other.constraints {
            for neg in c.negated()? {
                let mut trial = self.clone();
                trial.add(neg);
                if !trial.is_empty()? {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    fn elimination_cost(&self, var: usize) -> (u8, usize) {
        let mut has_eq = false;
        let mut pos = 0;
        let mut neg = 0;
        for c in &self.constraints {
            let a = c.coeff(var);
            if a == 0 {
                continue;
            }
            match c.kind {
                ConstraintKind::Equality => {
                    if a.abs() == 1 {
                        return (0, 0);
                    }
                    has_eq = true;
                }
                ConstraintKind::Inequality if a > 0 => pos += 1,
                ConstraintKind::Inequality => neg += 1,
            }
        }
        if has_eq {
            (1, 0)
        } else {
            (2, pos * neg)
        }
    }

    /// Index of the first equality involving `var` that satisfies `pred`
    pub fn find_equality<F>(&self, var: usize, pred: F) -> Option<usize>
    where
        F: Fn(&Constraint) -> bool,
    {
        self.constraints
            .iter()
            .position(|c| c.kind == ConstraintKind::Equality && c.coeff(var) != 0 && pred(c))
    }

    /// Eliminates `var` by substituting the equality at `pos`.
    ///
    /// The result is exact over the rationals; with a non-unit coefficient
    /// the divisibility condition on the remaining variables is dropped.
    pub fn eliminate_with_equality(&mut self, var: usize, pos: usize) -> Result<(), EngineError> {
        let old = std::mem::take(&mut self.constraints);
        let eq = old[pos].clone();
        let a = eq.coeff(var);
        for (i, c) in old.into_iter().enumerate() {
            if i == pos {
                continue;
            }
            let b = c.coeff(var);
            if b == 0 {
                self.push_derived(c);
            } else {
                self.push_derived(combine(&c, a.abs(), &eq, -a.signum() * b)?);
            }
        }
        self.simplify()
    }

    fn eliminate(&mut self, var: usize) -> Result<(), EngineError> {
        let eq_pos = self
            .constraints
            .iter()
            .enumerate()
            .filter(|(_, c)| c.kind == ConstraintKind::Equality && c.coeff(var) != 0)
            .min_by_key(|(_, c)| c.coeff(var).abs())
            .map(|(i, _)| i);
        if let Some(pos) = eq_pos {
            return self.eliminate_with_equality(var, pos);
        }

        let old = std::mem::take(&mut self.constraints);
        let mut lower = Vec::new();
        let mut upper = Vec::new();
        for c in old {
            let a = c.coeff(var);
            if a > 0 {
                lower.push(c);
            } else if a < 0 {
                upper.push(c);
            } else {
                self.push_derived(c);
            }
        }
        for l in &lower {
            for u in &upper {
                let a = l.coeff(var);
                let b = -u.coeff(var);
                self.push_derived(combine(l, b, u, a)?);
            }
            if self.constraints.len() > MAX_CONSTRAINTS {
                return Err(EngineError::TooComplex {
                    constraints: self.constraints.len(),
                });
            }
        }
        self.simplify()
    }

    fn push_derived(&mut self, mut c: Constraint) {
        if !c.normalize() {
            self.infeasible = true;
            return;
        }
        if !c.is_constant() {
            self.constraints.push(c);
        }
    }

    /// Removes duplicate and dominated constraints, merges opposite
    /// inequalities into equalities and detects syntactic contradictions.
    fn simplify(&mut self) -> Result<(), EngineError> {
        if self.infeasible {
            self.constraints.clear();
            return Ok(());
        }
        let mut eqs: Vec<Constraint> = Vec::new();
        let mut ineqs: HashMap<Vec<i64>, i64> = HashMap::new();
        let mut order: Vec<Vec<i64>> = Vec::new();
        for c in self.constraints.drain(..) {
            match c.kind {
                ConstraintKind::Equality => {
                    if let Some(other) = eqs.iter().find(|e| e.coeffs == c.coeffs) {
                        if other.constant != c.constant {
                            self.infeasible = true;
                        }
                    } else {
                        eqs.push(c);
                    }
                }
                ConstraintKind::Inequality => match ineqs.get_mut(&c.coeffs) {
                    Some(k) => *k = (*k).min(c.constant),
                    None => {
                        order.push(c.coeffs.clone());
                        ineqs.insert(c.coeffs, c.constant);
                    }
                },
            }
        }

        let mut dropped: HashSet<Vec<i64>> = HashSet::new();
        for coeffs in &order {
            if dropped.contains(coeffs) {
                continue;
            }
            let neg = negate(coeffs)?;
            if let (Some(&c1), Some(&c2)) = (ineqs.get(coeffs), ineqs.get(&neg)) {
                let slack = c1.checked_add(c2).ok_or(EngineError::Overflow)?;
                if slack < 0 {
                    self.infeasible = true;
                } else if slack == 0 {
                    let mut eq = Constraint::equality(coeffs.clone(), c1);
                    if eq.normalize() {
                        if !eqs.contains(&eq) {
                            eqs.push(eq);
                        }
                    } else {
                        self.infeasible = true;
                    }
                    dropped.insert(coeffs.clone());
                    dropped.insert(neg);
                }
            }
        }

        // inequalities parallel to an equality are either implied or violated
        for e in &eqs {
            let neg = negate(&e.coeffs)?;
            if let Some(&d) = ineqs.get(&e.coeffs) {
                if d < e.constant {
                    self.infeasible = true;
                }
                dropped.insert(e.coeffs.clone());
            }
            if let Some(&d) = ineqs.get(&neg) {
                if d.checked_add(e.constant).ok_or(EngineError::Overflow)? < 0 {
                    self.infeasible = true;
                }
                dropped.insert(neg);
            }
        }

        if self.infeasible {
            self.constraints.clear();
            return Ok(());
        }
        self.constraints = eqs;
        for coeffs in order {
            if dropped.contains(&coeffs) {
                continue;
            }
            let constant = ineqs[&coeffs];
            self.constraints
                .push(Constraint::inequality(coeffs, constant));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn box_1d(lo: i64, hi: i64) -> System {
        let mut sys = System::new(1);
        sys.add_inequality(&[(0, 1)], -lo);
        sys.add_inequality(&[(0, -1)], hi);
        sys
    }

    #[test]
    fn test_maximize_simple_interval() {
        let sys = box_1d(3, 17);
        assert_eq!(sys.maximize(&Aff::var(0)).unwrap(), Optimum::Value(17));
        assert_eq!(sys.minimize(&Aff::var(0)).unwrap(), Optimum::Value(3));
    }

    #[test]
    fn test_unbounded_and_empty() {
        let mut sys = System::new(1);
        sys.add_inequality(&[(0, 1)], 0);
        assert_eq!(sys.maximize(&Aff::var(0)).unwrap(), Optimum::Unbounded);

        let empty = box_1d(5, 4);
        assert!(empty.is_empty().unwrap());
        assert_eq!(empty.maximize(&Aff::var(0)).unwrap(), Optimum::Empty);
    }

    #[test]
    fn test_parity_conflict_is_empty() {
        // e = 2i and e = 2j + 1 have no common integer solution
        let mut sys = System::new(3);
        sys.add_equality(&[(0, 1), (1, -2)], 0);
        sys.add_equality(&[(0, 1), (2, -2)], -1);
        assert!(sys.is_empty().unwrap());
    }

    #[test]
    fn test_projection_keeps_numbering() {
        // x = y + 1, 0 <= y <= 9  ==>  1 <= x <= 10
        let mut sys = System::new(2);
        sys.add_equality(&[(0, 1), (1, -1)], -1);
        sys.add_inequality(&[(1, 1)], 0);
        sys.add_inequality(&[(1, -1)], 9);
        let proj = sys.project_out(&[1]).unwrap();
        assert!(!proj.involves(1));
        assert_eq!(proj.maximize(&Aff::var(0)).unwrap(), Optimum::Value(10));
        assert_eq!(proj.minimize(&Aff::var(0)).unwrap(), Optimum::Value(1));
    }

    #[test]
    fn test_integer_tightening_fixes_tile_remainder() {
        // inner = i - 32*q1 in [0, 31], t = inner - 32*q3 in [0, 31]
        // vars: 0 = i, 1 = q1, 2 = q3
        let mut sys = System::new(3);
        sys.add_inequality(&[(0, 1), (1, -32)], 0);
        sys.add_inequality(&[(0, -1), (1, 32)], 31);
        sys.add_inequality(&[(0, 1), (1, -32), (2, -32)], 0);
        sys.add_inequality(&[(0, -1), (1, 32), (2, 32)], 31);
        sys.fix_determined(2..3).unwrap();
        assert!(sys
            .constraints()
            .iter()
            .any(|c| c.kind == ConstraintKind::Equality && c.coeff(2) == 1 && c.constant == 0));
    }

    #[test]
    fn test_detect_equalities_from_opposite_bounds() {
        let mut sys = System::new(2);
        sys.add_inequality(&[(0, 1), (1, -1)], 0);
        sys.add_inequality(&[(0, -1), (1, 1)], 0);
        sys.detect_equalities().unwrap();
        assert_eq!(sys.constraints().len(), 1);
        assert_eq!(sys.constraints()[0].kind, ConstraintKind::Equality);
    }

    #[test]
    fn test_overflowing_bounds_are_reported() {
        // -MAX <= x <= MAX - 1: the width of the interval does not fit
        let sys = box_1d(-i64::MAX, i64::MAX - 1);
        assert_eq!(sys.is_empty(), Err(EngineError::Overflow));

        let mut low = System::new(1);
        low.add_inequality(&[(0, 1)], i64::MIN);
        assert_eq!(low.minimize(&Aff::var(0)), Err(EngineError::Overflow));
    }

    #[test]
    fn test_subset_check() {
        let small = box_1d(2, 5);
        let large = box_1d(0, 9);
        assert!(small.is_subset_of(&large).unwrap());
        assert!(!large.is_subset_of(&small).unwrap());
    }
}
