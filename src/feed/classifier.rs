//! Classification of store failures for the partition processor.
//!
//! [`classify`] is a pure function from a [`StoreError`] to the handful of
//! outcomes the read loop switches on.

use crate::error::{StoreError, StoreErrorKind};

/// How the partition processor reacts to a store failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The partition is gone; stop and let the controller re-lease it.
    PartitionNotFound,
    /// The partition split; stop and fan out to the children.
    PartitionSplit,
    /// Throttling or server trouble; keep looping.
    Transient,
    /// The page was too large; halve the page size and retry.
    PageTooLarge,
    /// The store client canceled the call on its own or because we asked it to.
    Canceled,
    /// Anything else; fatal.
    Undefined,
}

impl ErrorClass {
    /// Returns a string label for metrics.
    pub fn as_metric_label(&self) -> &'static str {
        match self {
            ErrorClass::PartitionNotFound => "partition_not_found",
            ErrorClass::PartitionSplit => "partition_split",
            ErrorClass::Transient => "transient",
            ErrorClass::PageTooLarge => "page_too_large",
            ErrorClass::Canceled => "canceled",
            ErrorClass::Undefined => "undefined",
        }
    }
}

/// Classify a store failure.
///
/// A read-session-not-available response is a 404 as well, but it is a
/// replica lag condition rather than a missing partition; it is left
/// undefined so it surfaces to the controller unchanged.
pub fn classify(error: &StoreError) -> ErrorClass {
    match error.kind() {
        StoreErrorKind::NotFound => ErrorClass::PartitionNotFound,
        StoreErrorKind::PartitionGone => ErrorClass::PartitionSplit,
        StoreErrorKind::Throttled | StoreErrorKind::ServerError => ErrorClass::Transient,
        StoreErrorKind::PageTooLarge => ErrorClass::PageTooLarge,
        StoreErrorKind::Canceled => ErrorClass::Canceled,
        StoreErrorKind::ReadSessionNotAvailable
        | StoreErrorKind::Gone
        | StoreErrorKind::Conflict
        | StoreErrorKind::PreconditionFailed
        | StoreErrorKind::Other => ErrorClass::Undefined,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_classify_from_status_codes() {
        assert_eq!(
            classify(&StoreError::from_status(404, 0, "gone")),
            ErrorClass::PartitionNotFound
        );
        assert_eq!(
            classify(&StoreError::from_status(404, 1002, "session")),
            ErrorClass::Undefined
        );
        assert_eq!(
            classify(&StoreError::from_status(410, 1002, "range gone")),
            ErrorClass::PartitionSplit
        );
        assert_eq!(
            classify(&StoreError::from_status(410, 1007, "splitting")),
            ErrorClass::PartitionSplit
        );
        assert_eq!(
            classify(&StoreError::from_status(410, 0, "gone")),
            ErrorClass::Undefined
        );
        assert_eq!(
            classify(&StoreError::from_status(429, 0, "slow down")),
            ErrorClass::Transient
        );
        assert_eq!(
            classify(&StoreError::from_status(503, 0, "unavailable")),
            ErrorClass::Transient
        );
        assert_eq!(
            classify(&StoreError::from_status(
                400,
                0,
                "Reduce page size and try again."
            )),
            ErrorClass::PageTooLarge
        );
        assert_eq!(
            classify(&StoreError::from_status(401, 0, "unauthorized")),
            ErrorClass::Undefined
        );
    }

    #[test]
    fn test_classify_canceled() {
        let err = StoreError::new(StoreErrorKind::Canceled, "operation canceled");
        assert_eq!(classify(&err), ErrorClass::Canceled);
    }

    #[test]
    fn test_classification_ignores_retry_after() {
        let err = StoreError::throttled(Duration::from_secs(1));
        assert_eq!(classify(&err), ErrorClass::Transient);
    }
}
