use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ModelError {
    #[error("shape mismatch for {what}: expected {expected}, got {actual}")]
    ShapeMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("{kind} id {id} out of range (table has {len} rows)")]
    IndexOutOfRange {
        kind: &'static str,
        id: usize,
        len: usize,
    },

    #[error("parameter {path} has shape {actual:?}, expected {expected:?}")]
    ParameterShape {
        path: &'static str,
        expected: (usize, usize),
        actual: (usize, usize),
    },

    #[error("cannot compute loss over an empty batch")]
    EmptyBatch,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("non-finite value in {0}")]
    NonFinite(&'static str),
}

pub type Result<T> = std::result::Result<T, ModelError>;
