use thiserror::Error;

/// Errors raised by the control-flow compiler and the n-gram search.
#[derive(Debug, Error)]
pub(crate) enum Error {
    /// An instruction's annotation or operands could not be decoded.
    #[error("{class}.{method},{index}: malformed instruction: {detail}")]
    MalformedInstruction {
        class: String,
        method: String,
        index: usize,
        detail: String,
    },

    /// A compiled graph broke one of its shape invariants.
    #[error("control flow invariant violated at {location}: {detail}")]
    Invariant { location: String, detail: String },

    /// The requested call sequence is empty.
    #[error("empty call sequence")]
    EmptySequence,

    /// The requested call sequence length differs from the n-gram size.
    #[error("length of call sequence ({actual}) doesn't match n-gram size ({expected})")]
    LengthMismatch { expected: usize, actual: usize },

    /// The n-gram size is not usable.
    #[error("invalid n-gram size: {0}")]
    InvalidNgramSize(i64),

    /// No compiled graph exists for the method.
    #[error("no compiled method for {0}")]
    UnknownMethod(String),

    /// A seeded search named an index without a program point.
    #[error("{method} has no program point at index {index}")]
    UnknownStartIndex { method: String, index: usize },

    /// A location string could not be parsed.
    #[error("invalid location: {0}")]
    InvalidLocation(String),
}

pub(crate) type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn invariant(location: impl Into<String>, detail: impl Into<String>) -> Self {
        Error::Invariant {
            location: location.into(),
            detail: detail.into(),
        }
    }

    /// Configuration errors are reported per item and do not stop a batch.
    pub(crate) fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::EmptySequence
                | Error::LengthMismatch { .. }
                | Error::InvalidNgramSize(_)
                | Error::UnknownMethod(_)
                | Error::UnknownStartIndex { .. }
                | Error::InvalidLocation(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_offending_input() {
        let err = Error::MalformedInstruction {
            class: "a/B".to_string(),
            method: "m:()V".to_string(),
            index: 7,
            detail: "no method reference".to_string(),
        };
        assert_eq!(
            "a/B.m:()V,7: malformed instruction: no method reference",
            err.to_string()
        );
        assert!(!err.is_configuration());
        assert!(
            Error::LengthMismatch {
                expected: 6,
                actual: 3
            }
            .is_configuration()
        );
    }
}
