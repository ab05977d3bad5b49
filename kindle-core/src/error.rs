use thiserror::Error;

use crate::types::TokenId;

#[derive(Error, Debug)]
pub enum KindleError {
    #[error("KV cache capacity exceeded: {current} + {incoming} > {capacity}")]
    CapacityExceeded {
        current: usize,
        incoming: usize,
        capacity: usize,
    },

    #[error("cannot shift {n_discard} positions out of a KV cache holding {n}")]
    ShiftOutOfRange { n_discard: usize, n: usize },

    #[error("Token not found: {0}")]
    TokenNotFound(String),

    #[error("Tokenized length {needed} exceeds buffer capacity {capacity}")]
    TokenizeOverflow { needed: usize, capacity: usize },

    #[error("Grammar exhausted: every candidate was rejected")]
    GrammarExhausted,

    #[error("Grammar rejected token {token}")]
    GrammarRejected { token: TokenId },

    #[error("Grammar parse error: {0}")]
    GrammarParse(String),

    #[error("State load error: {0}")]
    StateLoad(String),

    #[error("Model load error: {0}")]
    ModelLoad(String),

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse failure classes a host application can branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// KV cache append or shift outside its bounds. Not recoverable.
    Capacity,
    /// Unknown token text/id or a tokenization that does not fit the caller's buffer.
    Lookup,
    /// The grammar automaton rejected every candidate (or the chosen token).
    GrammarExhausted,
    /// A grammar, state, model or tokenizer file could not be read or parsed.
    Load,
    /// Caller passed inconsistent arguments or an engine returned malformed output.
    Usage,
}

impl KindleError {
    pub fn class(&self) -> ErrorClass {
        match self {
            KindleError::CapacityExceeded { .. } | KindleError::ShiftOutOfRange { .. } => {
                ErrorClass::Capacity
            }
            KindleError::TokenNotFound(_) | KindleError::TokenizeOverflow { .. } => {
                ErrorClass::Lookup
            }
            KindleError::GrammarExhausted | KindleError::GrammarRejected { .. } => {
                ErrorClass::GrammarExhausted
            }
            KindleError::GrammarParse(_)
            | KindleError::StateLoad(_)
            | KindleError::ModelLoad(_)
            | KindleError::Tokenizer(_)
            | KindleError::Io(_)
            | KindleError::Json(_) => ErrorClass::Load,
            KindleError::InvalidArgument(_)
            | KindleError::ShapeMismatch { .. }
            | KindleError::Internal(_) => ErrorClass::Usage,
        }
    }

    /// Whether retrying the same call on the same state could ever succeed.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::Capacity | ErrorClass::GrammarExhausted
        )
    }
}

pub type Result<T> = std::result::Result<T, KindleError>;
