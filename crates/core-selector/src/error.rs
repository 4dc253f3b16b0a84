//! Error types for selection and transfer tracking

use crate::model::{InstanceId, TransferId, TransferRequest};
use crate::tracker::TransferState;
use thiserror::Error;

/// Result type for selector operations
pub type Result<T> = std::result::Result<T, SelectorError>;

/// Errors surfaced by the registry, the strategies, the selector service and
/// the transfer tracker.
///
/// Every variant is local and recoverable by the caller. None of them is
/// retried internally.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SelectorError {
    /// An instance with this id is already registered (or still referenced
    /// by a retained transfer record)
    #[error("Data-plane instance already registered: {0}")]
    DuplicateInstance(InstanceId),

    /// No instance with this id is registered
    #[error("Unknown data-plane instance: {0}")]
    UnknownInstance(InstanceId),

    /// The transfer request is missing a required field
    #[error("Invalid transfer request: {0}")]
    InvalidRequest(String),

    /// No live instance supports the requested source/destination/transfer type
    #[error("No eligible data-plane instance for {source_type} -> {destination_type} ({transfer_type})")]
    NoEligibleInstance {
        source_type: String,
        destination_type: String,
        transfer_type: String,
    },

    /// The hinted instance is not among the live, capable candidates
    #[error("Hinted data-plane instance {0} is not available for this request")]
    HintInstanceUnavailable(InstanceId),

    /// The requested lifecycle transition is not allowed from the current state
    #[error("Invalid transition for transfer {transfer_id}: {from} -> {to}")]
    InvalidTransition {
        transfer_id: TransferId,
        from: TransferState,
        to: TransferState,
    },

    /// Only terminal records may be purged
    #[error("Transfer {0} is still active and cannot be purged")]
    RecordStillActive(TransferId),

    /// No record with this transfer id is tracked
    #[error("Unknown transfer: {0}")]
    UnknownTransfer(TransferId),

    /// The request named a strategy that is not registered
    #[error("Unknown selection strategy: {0}")]
    UnknownStrategy(String),
}

impl SelectorError {
    /// Create an invalid request error with a message
    pub fn invalid_request<S: Into<String>>(message: S) -> Self {
        SelectorError::InvalidRequest(message.into())
    }

    /// No candidate for the routing key of `request`
    pub fn no_eligible_instance(request: &TransferRequest) -> Self {
        SelectorError::NoEligibleInstance {
            source_type: request.source_type.to_string(),
            destination_type: request.destination_type.to_string(),
            transfer_type: request.transfer_type.to_string(),
        }
    }

    /// Short, stable label used as a metric tag for this error kind
    pub fn kind(&self) -> &'static str {
        match self {
            SelectorError::DuplicateInstance(_) => "duplicate_instance",
            SelectorError::UnknownInstance(_) => "unknown_instance",
            SelectorError::InvalidRequest(_) => "invalid_request",
            SelectorError::NoEligibleInstance { .. } => "no_eligible_instance",
            SelectorError::HintInstanceUnavailable(_) => "hint_instance_unavailable",
            SelectorError::InvalidTransition { .. } => "invalid_transition",
            SelectorError::RecordStillActive(_) => "record_still_active",
            SelectorError::UnknownTransfer(_) => "unknown_transfer",
            SelectorError::UnknownStrategy(_) => "unknown_strategy",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SelectorError::NoEligibleInstance {
            source_type: "HttpData".to_string(),
            destination_type: "AmazonS3".to_string(),
            transfer_type: "push".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "No eligible data-plane instance for HttpData -> AmazonS3 (push)"
        );

        let err = SelectorError::invalid_request("source type is empty");
        assert_eq!(
            err.to_string(),
            "Invalid transfer request: source type is empty"
        );
    }

    #[test]
    fn test_invalid_transition_display() {
        let id = TransferId::new();
        let err = SelectorError::InvalidTransition {
            transfer_id: id,
            from: TransferState::Created,
            to: TransferState::Completed,
        };
        assert_eq!(
            err.to_string(),
            format!("Invalid transition for transfer {}: created -> completed", id)
        );
    }

    #[test]
    fn test_error_kind_labels() {
        assert_eq!(
            SelectorError::DuplicateInstance(InstanceId::from("a")).kind(),
            "duplicate_instance"
        );
        assert_eq!(
            SelectorError::UnknownStrategy("x".into()).kind(),
            "unknown_strategy"
        );
        assert_eq!(
            SelectorError::RecordStillActive(TransferId::new()).kind(),
            "record_still_active"
        );
    }
}
