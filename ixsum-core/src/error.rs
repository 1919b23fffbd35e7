//! Analysis-time diagnostics.
//!
//! Everything an equation can get wrong is reported here, at expansion time;
//! the only checks deferred to run time are the ones that depend on array
//! shapes (rank, range agreement, output origin).

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("unsupported equation: {0}")]
    Equation(String),

    #[error("unknown option `{0}`")]
    UnknownOption(String),

    #[error("illegal value for option `{0}`: {1}")]
    OptionValue(String, String),

    #[error("unsupported index expression `{0}`")]
    IndexForm(String),

    #[error("unsupported left-hand index `{0}` when creating a new array")]
    LeftIndex(String),

    #[error("unable to infer the range of index `{0}`")]
    Unconstrained(String),

    #[error("`$` must be followed by a plain name")]
    Interpolation,

    #[error("can't create a new array `{0}` when `{0}` also appears on the right")]
    SelfReference(String),

    #[error("bad range declaration: {0}")]
    RangeDecl(String),
}

pub type Result<T> = std::result::Result<T, Error>;
