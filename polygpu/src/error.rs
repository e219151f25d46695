//! Error types for the GPU mapping pipeline
//!
//! Errors fall into two classes:
//! - **Heuristic failures** (a tile bound cannot be proven finite, the shared
//!   memory budget is exceeded) are never errors. They are resolved locally by
//!   falling back to a coarser placement and only show up in the logs.
//! - **Structural failures** (algebra engine failures, a forced-private array
//!   that cannot be tiled, malformed input) abort the current compilation unit
//!   and propagate unchanged to [`crate::pipeline::GpuPipeline::compile`].

use thiserror::Error;

/// Failures of the polyhedral algebra engine.
///
/// Any of these is fatal for the compilation unit being processed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Integer overflow while combining constraints
    #[error("integer overflow while combining constraints")]
    Overflow,

    /// Variable elimination produced more constraints than the engine accepts
    #[error("constraint system too complex ({constraints} constraints after elimination)")]
    TooComplex { constraints: usize },

    /// Two objects of incompatible spaces were combined
    #[error("space mismatch: {0}")]
    SpaceMismatch(String),
}

/// Errors raised while reading textual affine expressions and constraints
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Empty expression
    #[error("empty affine expression")]
    Empty,

    /// Token sequence that is not an affine term
    #[error("malformed affine expression near '{0}'")]
    Syntax(String),

    /// Identifier that is neither a parameter nor an iterator in scope
    #[error("unknown identifier '{0}'")]
    UnknownName(String),

    /// Constant or coefficient outside the 64-bit range
    #[error("value out of range in '{0}'")]
    Overflow(String),

    /// Constraint clause without a comparison operator
    #[error("constraint '{0}' has no comparison operator")]
    MissingComparison(String),
}

/// Top-level error of the GPU mapping pipeline
#[derive(Error, Debug)]
pub enum GpuError {
    /// Failure of the algebra engine
    #[error("algebra engine failure: {0}")]
    Engine(#[from] EngineError),

    /// An array required to live in private memory cannot be tiled
    #[error("unable to map array '{array}' to private memory")]
    PlacementViolation { array: String },

    /// Malformed polyhedral program
    #[error("invalid program: {0}")]
    InvalidProgram(String),

    /// Inconsistent mapping options
    #[error("invalid options: {0}")]
    InvalidOptions(String),

    /// Malformed textual affine input
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    /// JSON (de)serialization failure
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error when reading option or program files
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the crate
pub type Result<T, E = GpuError> = std::result::Result<T, E>;
