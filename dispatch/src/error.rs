use thiserror::Error;

/// Failure taxonomy shared by every store and lifecycle operation.
///
/// Each variant maps to a machine-readable kind carried on the wire, plus a
/// human-readable message. The core never retries; idempotent operations
/// (such as the rating upsert) absorb duplicate submissions on their own.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// A referenced ride, taxi, or user does not exist.
    #[error("{0} not found")]
    NotFound(&'static str),
    /// The caller is authenticated but not authorized for this mutation.
    #[error("{0}")]
    Forbidden(&'static str),
    /// Malformed or out-of-range input.
    #[error("{0}")]
    InvalidArgument(&'static str),
    /// The action is not valid given the record's current state.
    #[error("{0}")]
    InvalidState(&'static str),
}

impl DispatchError {
    /// Stable identifier used in wire-level error frames.
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::NotFound(_) => "not_found",
            DispatchError::Forbidden(_) => "forbidden",
            DispatchError::InvalidArgument(_) => "invalid_argument",
            DispatchError::InvalidState(_) => "invalid_state",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        assert_eq!(DispatchError::NotFound("ride").kind(), "not_found");
        assert_eq!(DispatchError::Forbidden("nope").kind(), "forbidden");
        assert_eq!(
            DispatchError::InvalidArgument("bad").kind(),
            "invalid_argument"
        );
        assert_eq!(DispatchError::InvalidState("bad").kind(), "invalid_state");
    }

    #[test]
    fn not_found_message_names_the_record() {
        assert_eq!(DispatchError::NotFound("taxi").to_string(), "taxi not found");
    }
}
