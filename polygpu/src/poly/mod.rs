//! Polyhedral algebra used by the mapping pipeline
//!
//! A narrow interface:
//! - [`Aff`], [`Div`], [`LocalSpace`]: affine and floor-division expressions
//! - [`System`]: integer constraint systems with projection, emptiness and
//!   optimization queries
//! - [`parse`]: textual affine expressions for building programs by hand

pub mod aff;
pub mod parse;
pub mod system;

pub use aff::{ceil_div, floor_div, gcd, Aff, AffConstraint, Div, LocalSpace};
pub use parse::{parse_aff, parse_constraints};
pub use system::{Constraint, ConstraintKind, Optimum, System};
