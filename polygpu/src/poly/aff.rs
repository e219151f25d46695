//! Affine and quasi-affine functions over an indexed variable space
//!
//! An [`Aff`] is `Σ coeffs[i]·x_i + constant` where the meaning of each index
//! is fixed by the surrounding [`LocalSpace`]: parameters first, then the
//! statement iterators, then integer divisions introduced by tiling.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

use super::system::ConstraintKind;
use crate::error::EngineError;

/// Floor of `a / b` for `b > 0`
pub fn floor_div(a: i64, b: i64) -> i64 {
    let q = a / b;
    if (a % b != 0) && ((a < 0) != (b < 0)) {
        q - 1
    } else {
        q
    }
}

/// Ceiling of `a / b` for `b > 0`
pub fn ceil_div(a: i64, b: i64) -> i64 {
    -floor_div(-a, b)
}

/// Greatest common divisor (always non-negative)
pub fn gcd(a: i64, b: i64) -> i64 {
    let (mut a, mut b) = (a.abs(), b.abs());
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

/// Affine expression `Σ coeffs[i]·x_i + constant`.
///
/// Coefficients beyond the end of `coeffs` are zero, so expressions built
/// in a smaller space can be used unchanged in any extension of it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Aff {
    pub coeffs: Vec<i64>,
    pub constant: i64,
}

impl Aff {
    /// Constant expression
    pub fn constant(value: i64) -> Self {
        Self {
            coeffs: Vec::new(),
            constant: value,
        }
    }

    /// The variable with the given index
    pub fn var(index: usize) -> Self {
        Self::term(index, 1)
    }

    /// `coeff · x_index`
    pub fn term(index: usize, coeff: i64) -> Self {
        let mut aff = Self::constant(0);
        aff.set_coeff(index, coeff);
        aff
    }

    pub fn coeff(&self, index: usize) -> i64 {
        self.coeffs.get(index).copied().unwrap_or(0)
    }

    pub fn set_coeff(&mut self, index: usize, value: i64) {
        if index >= self.coeffs.len() {
            if value == 0 {
                return;
            }
            self.coeffs.resize(index + 1, 0);
        }
        self.coeffs[index] = value;
        self.trim();
    }

    /// Number of leading coefficients that may be non-zero
    pub fn len(&self) -> usize {
        self.coeffs
            .iter()
            .rposition(|&c| c != 0)
            .map_or(0, |p| p + 1)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_constant(&self) -> bool {
        self.coeffs.iter().all(|&c| c == 0)
    }

    pub fn involves(&self, index: usize) -> bool {
        self.coeff(index) != 0
    }

    /// Does the expression involve any variable in `[start, end)`?
    pub fn involves_range(&self, start: usize, end: usize) -> bool {
        (start..end).any(|i| self.involves(i))
    }

    pub fn add(&self, other: &Aff) -> Result<Aff, EngineError> {
        let n = self.coeffs.len().max(other.coeffs.len());
        let coeffs = (0..n)
            .map(|i| checked(self.coeff(i).checked_add(other.coeff(i))))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Aff {
            coeffs,
            constant: checked(self.constant.checked_add(other.constant))?,
        }
        .trimmed())
    }

    pub fn sub(&self, other: &Aff) -> Result<Aff, EngineError> {
        self.add(&other.scale(-1)?)
    }

    pub fn scale(&self, factor: i64) -> Result<Aff, EngineError> {
        let coeffs = self
            .coeffs
            .iter()
            .map(|c| checked(c.checked_mul(factor)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Aff {
            coeffs,
            constant: checked(self.constant.checked_mul(factor))?,
        }
        .trimmed())
    }

    pub fn add_constant(&self, value: i64) -> Result<Aff, EngineError> {
        let mut aff = self.clone();
        aff.constant = checked(aff.constant.checked_add(value))?;
        Ok(aff)
    }

    /// Keeps only the coefficients of variables below `n`
    pub fn truncated(&self, n: usize) -> Aff {
        let mut aff = self.clone();
        aff.coeffs.truncate(n);
        aff.trimmed()
    }

    /// Renumbers variables: variable `i` becomes `map[i]`
    pub fn remapped(&self, map: &[usize]) -> Aff {
        let mut out = Aff::constant(self.constant);
        for (i, &c) in self.coeffs.iter().enumerate() {
            if c != 0 {
                let target = map[i];
                out.set_coeff(target, out.coeff(target) + c);
            }
        }
        out
    }

    pub fn eval(&self, values: &[i64]) -> Result<i64, EngineError> {
        let mut sum = self.constant;
        for (i, &c) in self.coeffs.iter().enumerate() {
            if c == 0 {
                continue;
            }
            let term = checked(c.checked_mul(values.get(i).copied().unwrap_or(0)))?;
            sum = checked(sum.checked_add(term))?;
        }
        Ok(sum)
    }

    /// Renders the expression with the given variable names
    pub fn to_string_with(&self, names: &[String]) -> String {
        let mut out = String::new();
        for (i, &c) in self.coeffs.iter().enumerate() {
            if c == 0 {
                continue;
            }
            let name = names.get(i).cloned().unwrap_or_else(|| format!("x{}", i));
            let sign = if c < 0 { "-" } else { "+" };
            if out.is_empty() {
                if c < 0 {
                    out.push('-');
                }
            } else {
                out.push_str(&format!(" {} ", sign));
            }
            if c.abs() != 1 {
                out.push_str(&format!("{}*", c.abs()));
            }
            out.push_str(&name);
        }
        if out.is_empty() {
            return self.constant.to_string();
        }
        if self.constant > 0 {
            out.push_str(&format!(" + {}", self.constant));
        } else if self.constant < 0 {
            out.push_str(&format!(" - {}", -self.constant));
        }
        out
    }

    fn trim(&mut self) {
        let n = self.len();
        self.coeffs.truncate(n);
    }

    fn trimmed(mut self) -> Aff {
        self.trim();
        self
    }
}

fn checked(value: Option<i64>) -> Result<i64, EngineError> {
    value.ok_or(EngineError::Overflow)
}

impl PartialEq for Aff {
    fn eq(&self, other: &Self) -> bool {
        let n = self.coeffs.len().max(other.coeffs.len());
        self.constant == other.constant && (0..n).all(|i| self.coeff(i) == other.coeff(i))
    }
}

impl Eq for Aff {}

impl Hash for Aff {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.coeffs[..self.len()].hash(state);
        self.constant.hash(state);
    }
}

impl fmt::Display for Aff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_with(&[]))
    }
}

/// Affine constraint `aff = 0` or `aff >= 0`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AffConstraint {
    pub aff: Aff,
    pub kind: ConstraintKind,
}

impl AffConstraint {
    pub fn equality(aff: Aff) -> Self {
        Self {
            aff,
            kind: ConstraintKind::Equality,
        }
    }

    pub fn inequality(aff: Aff) -> Self {
        Self {
            aff,
            kind: ConstraintKind::Inequality,
        }
    }

    pub fn holds(&self, values: &[i64]) -> Result<bool, EngineError> {
        let v = self.aff.eval(values)?;
        Ok(match self.kind {
            ConstraintKind::Equality => v == 0,
            ConstraintKind::Inequality => v >= 0,
        })
    }

    pub fn remapped(&self, map: &[usize]) -> Self {
        Self {
            aff: self.aff.remapped(map),
            kind: self.kind,
        }
    }
}

/// Integer division `floor(num / den)` introduced as a local variable
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Div {
    pub num: Aff,
    pub den: i64,
}

/// Variable space of a statement: `[params | iterators | divs]`.
///
/// Each div may refer to parameters, iterators and earlier divs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalSpace {
    pub n_param: usize,
    pub n_iter: usize,
    pub divs: Vec<Div>,
}

impl LocalSpace {
    pub fn new(n_param: usize, n_iter: usize) -> Self {
        Self {
            n_param,
            n_iter,
            divs: Vec::new(),
        }
    }

    /// Total number of variables
    pub fn dim(&self) -> usize {
        self.n_param + self.n_iter + self.divs.len()
    }

    /// Index of the first iterator
    pub fn iter_offset(&self) -> usize {
        self.n_param
    }

    /// Index of the first div
    pub fn div_offset(&self) -> usize {
        self.n_param + self.n_iter
    }

    /// Adds `floor(num / den)` (reusing an identical div) and returns its
    /// variable index.
    pub fn add_div(&mut self, num: Aff, den: i64) -> usize {
        debug_assert!(den > 0);
        let div = Div { num, den };
        if let Some(pos) = self.divs.iter().position(|d| *d == div) {
            return self.div_offset() + pos;
        }
        self.divs.push(div);
        self.div_offset() + self.divs.len() - 1
    }

    /// `floor(aff / den)` as an affine expression of this space.
    ///
    /// Constant numerators are folded, `den == 1` returns `aff` itself.
    pub fn floor(&mut self, aff: &Aff, den: i64) -> Aff {
        if den == 1 {
            return aff.clone();
        }
        if aff.is_constant() {
            return Aff::constant(floor_div(aff.constant, den));
        }
        Aff::var(self.add_div(aff.clone(), den))
    }

    /// `aff mod den` as an affine expression of this space
    pub fn modulo(&mut self, aff: &Aff, den: i64) -> Result<Aff, EngineError> {
        let q = self.floor(aff, den);
        aff.sub(&q.scale(den)?)
    }

    /// Constraints defining every div:
    /// `num - den·q >= 0` and `den·q + den - 1 - num >= 0`
    pub fn div_constraints(&self) -> Result<Vec<AffConstraint>, EngineError> {
        let mut out = Vec::with_capacity(2 * self.divs.len());
        for (k, div) in self.divs.iter().enumerate() {
            let q = Aff::term(self.div_offset() + k, div.den);
            out.push(AffConstraint::inequality(div.num.sub(&q)?));
            out.push(AffConstraint::inequality(
                q.sub(&div.num)?.add_constant(div.den - 1)?,
            ));
        }
        Ok(out)
    }

    /// Extends `[params | iterators]` values with the values of every div
    pub fn eval(&self, base: &[i64]) -> Result<Vec<i64>, EngineError> {
        let mut values = base[..self.n_param + self.n_iter].to_vec();
        for div in &self.divs {
            let v = floor_div(div.num.eval(&values)?, div.den);
            values.push(v);
        }
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_floor_and_ceil_division() {
        assert_eq!(floor_div(7, 2), 3);
        assert_eq!(floor_div(-7, 2), -4);
        assert_eq!(ceil_div(7, 2), 4);
        assert_eq!(ceil_div(-7, 2), -3);
        assert_eq!(floor_div(-8, 4), -2);
    }

    #[test]
    fn test_aff_equality_ignores_trailing_zeros() {
        let a = Aff {
            coeffs: vec![1, 0, 0],
            constant: 2,
        };
        let b = Aff::var(0).add_constant(2).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 1);
    }

    #[test]
    fn test_local_space_tiling_divs() {
        // [N | i] with floor(i/32) and i mod 32
        let mut ls = LocalSpace::new(1, 1);
        let i = Aff::var(1);
        let outer = ls.floor(&i, 32);
        let inner = i.sub(&outer.scale(32).unwrap()).unwrap();
        assert_eq!(ls.divs.len(), 1);
        let values = ls.eval(&[100, 70]).unwrap();
        assert_eq!(outer.eval(&values).unwrap(), 2);
        assert_eq!(inner.eval(&values).unwrap(), 6);

        // identical divs are shared
        let again = ls.floor(&i, 32);
        assert_eq!(again, outer);
        assert_eq!(ls.divs.len(), 1);
    }

    #[test]
    fn test_render_with_names() {
        let names = vec!["N".to_string(), "i".to_string()];
        let aff = Aff::term(1, 2).add(&Aff::var(0)).unwrap().add_constant(-1).unwrap();
        assert_eq!(aff.to_string_with(&names), "N + 2*i - 1");
        assert_eq!(aff.to_string(), "x0 + 2*x1 - 1");
    }

    #[test]
    fn test_arithmetic_overflow_is_reported() {
        let big = Aff::var(0).add_constant(i64::MAX).unwrap();
        assert_eq!(big.add_constant(1), Err(EngineError::Overflow));
        assert_eq!(big.scale(2), Err(EngineError::Overflow));
        assert_eq!(big.eval(&[1]), Err(EngineError::Overflow));
        assert_eq!(Aff::term(0, i64::MIN).scale(-1), Err(EngineError::Overflow));
        assert_eq!(big.eval(&[-1]), Ok(i64::MAX - 1));
    }
}
