//! Textual affine expressions and constraint chains
//!
//! Used by [`crate::scop::ScopBuilder`] so that programs can be written as
//!
//! ```text
//! domain:   "0 <= i < N and 0 <= j <= i"
//! access:   "2*i + 1", "j - N"
//! ```
//!
//! Names are resolved against an ordered list; the position of a name in the
//! list is its variable index in the resulting [`Aff`].

use lazy_static::lazy_static;
use log::trace;
use regex::Regex;

use super::aff::{Aff, AffConstraint};
use crate::error::ParseError;

lazy_static! {
    /// One signed term: optional sign, optional coefficient, optional `*`, optional name
    static ref TERM: Regex = Regex::new(r"^([+-]?)(\d*)(\*?)([A-Za-z_][A-Za-z0-9_]*)?").unwrap();
    /// Comparison operators of a constraint chain (longest first)
    static ref CMP: Regex = Regex::new(r"(<=|>=|==|<|>|=)").unwrap();
    /// Clause separators of a conjunction
    static ref AND: Regex = Regex::new(r"\s+and\s+|&&|,").unwrap();
}

/// Parses an affine expression such as `2*i - N + 3`.
///
/// # Arguments
/// * `text` - expression text, whitespace insensitive
/// * `names` - variable names; `names[k]` becomes variable `k`
///
/// # Errors
/// `ParseError::Empty` for blank input, `ParseError::Syntax` for anything
/// that is not a sum of terms, `ParseError::UnknownName` for identifiers
/// missing from `names`.
pub fn parse_aff(text: &str, names: &[&str]) -> Result<Aff, ParseError> {
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.is_empty() {
        return Err(ParseError::Empty);
    }

    let mut aff = Aff::constant(0);
    let mut rest = compact.as_str();
    let mut first = true;
    while !rest.is_empty() {
        let caps = TERM
            .captures(rest)
            .ok_or_else(|| ParseError::Syntax(rest.to_string()))?;
        let whole = caps.get(0).map_or("", |m| m.as_str());
        let sign = caps.get(1).map_or("", |m| m.as_str());
        let digits = caps.get(2).map_or("", |m| m.as_str());
        let star = caps.get(3).map_or("", |m| m.as_str());
        let name = caps.get(4).map(|m| m.as_str());

        if whole.is_empty() || (sign.is_empty() && !first) {
            return Err(ParseError::Syntax(rest.to_string()));
        }
        if digits.is_empty() && name.is_none() {
            return Err(ParseError::Syntax(rest.to_string()));
        }
        if !star.is_empty() && (digits.is_empty() || name.is_none()) {
            return Err(ParseError::Syntax(rest.to_string()));
        }

        let magnitude = if digits.is_empty() {
            1
        } else {
            digits
                .parse::<i64>()
                .map_err(|_| ParseError::Syntax(digits.to_string()))?
        };
        let value = if sign == "-" { -magnitude } else { magnitude };
        match name {
            Some(name) => {
                let index = names
                    .iter()
                    .position(|n| *n == name)
                    .ok_or_else(|| ParseError::UnknownName(name.to_string()))?;
                let coeff = aff
                    .coeff(index)
                    .checked_add(value)
                    .ok_or_else(|| ParseError::Overflow(text.to_string()))?;
                aff.set_coeff(index, coeff);
            }
            None => {
                aff.constant = aff
                    .constant
                    .checked_add(value)
                    .ok_or_else(|| ParseError::Overflow(text.to_string()))?
            }
        }

        rest = &rest[whole.len()..];
        first = false;
    }
    Ok(aff)
}

/// Parses a conjunction of comparison chains, e.g. `0 <= i < N and j >= 1`.
///
/// Blank input is the universe (no constraints).
pub fn parse_constraints(text: &str, names: &[&str]) -> Result<Vec<AffConstraint>, ParseError> {
    let mut out = Vec::new();
    for clause in AND.split(text) {
        let clause = clause.trim();
        if clause.is_empty() {
            continue;
        }
        out.extend(parse_chain(clause, names)?);
    }
    trace!("parsed {} constraints from '{}'", out.len(), text);
    Ok(out)
}

fn parse_chain(clause: &str, names: &[&str]) -> Result<Vec<AffConstraint>, ParseError> {
    let ops: Vec<&str> = CMP.find_iter(clause).map(|m| m.as_str()).collect();
    if ops.is_empty() {
        return Err(ParseError::MissingComparison(clause.to_string()));
    }
    let operands = CMP
        .split(clause)
        .map(|part| parse_aff(part, names))
        .collect::<Result<Vec<_>, _>>()?;

    let mut out = Vec::with_capacity(ops.len());
    for (k, op) in ops.iter().enumerate() {
        let lhs = &operands[k];
        let rhs = &operands[k + 1];
        let constraint = match *op {
            "<=" => rhs.sub(lhs).map(AffConstraint::inequality),
            "<" => rhs
                .sub(lhs)
                .and_then(|a| a.add_constant(-1))
                .map(AffConstraint::inequality),
            ">=" => lhs.sub(rhs).map(AffConstraint::inequality),
            ">" => lhs
                .sub(rhs)
                .and_then(|a| a.add_constant(-1))
                .map(AffConstraint::inequality),
            _ => lhs.sub(rhs).map(AffConstraint::equality),
        };
        out.push(constraint.map_err(|_| ParseError::Overflow(clause.to_string()))?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_terms() {
        let aff = parse_aff("2*i - N + 3", &["N", "i"]).unwrap();
        let expected = Aff::term(1, 2).sub(&Aff::var(0)).unwrap().add_constant(3).unwrap();
        assert_eq!(aff, expected);

        let juxtaposed = parse_aff("-3j+1", &["N", "i", "j"]).unwrap();
        assert_eq!(juxtaposed, Aff::term(2, -3).add_constant(1).unwrap());
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(parse_aff("  ", &[]), Err(ParseError::Empty));
        assert_eq!(
            parse_aff("i + k", &["i"]),
            Err(ParseError::UnknownName("k".to_string()))
        );
        assert!(matches!(parse_aff("i ++", &["i"]), Err(ParseError::Syntax(_))));
        assert!(matches!(
            parse_constraints("i + 1", &["i"]),
            Err(ParseError::MissingComparison(_))
        ));
    }

    #[test]
    fn test_parse_chain() {
        let names = ["N", "i"];
        let cs = parse_constraints("0 <= i < N and i >= 2", &names).unwrap();
        assert_eq!(cs.len(), 3);
        // i = 5, N = 10 satisfies all; i = 10 violates i < N
        let all = |values: &[i64]| cs.iter().all(|c| c.holds(values).unwrap());
        assert!(all(&[10, 5]));
        assert!(!all(&[10, 10]));
        assert!(!all(&[10, 1]));
    }

    #[test]
    fn test_out_of_range_constants() {
        let max = "9223372036854775807";
        assert!(parse_aff(&format!("i + {}", max), &["i"]).is_ok());
        assert!(matches!(
            parse_aff(&format!("{} + 1", max), &["i"]),
            Err(ParseError::Overflow(_))
        ));
        // i < MIN becomes MIN - i - 1 >= 0
        assert!(matches!(
            parse_constraints(&format!("i < -{} - 1", max), &["i"]),
            Err(ParseError::Overflow(_))
        ));
    }

    #[test]
    fn test_blank_constraints_are_universe() {
        assert!(parse_constraints("", &["i"]).unwrap().is_empty());
    }
}
