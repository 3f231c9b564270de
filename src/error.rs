//! Store-boundary errors.
//!
//! This module provides the error type every external collaborator (source
//! store client, document store, lease manager backend) reports.
//!
//! # Error Hierarchy
//!
//! The crate uses a two-layer error hierarchy:
//!
//! ## Boundary Layer (`crate::error`)
//!
//! - [`StoreError`]: a failure reported by a store client
//! - [`StoreErrorKind`]: the closed set of failure kinds, computed once when the
//!   error is built from the store's status and sub-status codes
//!
//! ## Processing Layer (`crate::feed::error`)
//!
//! - [`FeedError`]: partition-not-found, split, lease-lost, observer (user code)
//!   and the rest of the processing taxonomy
//!
//! ## Conversion
//!
//! [`StoreError`] converts into [`FeedError::Store`] via `From`, so store
//! failures that are not recovered locally surface unchanged.
//!
//! [`FeedError`]: crate::feed::FeedError
//! [`FeedError::Store`]: crate::feed::FeedError::Store

use std::fmt;
use std::time::Duration;

use thiserror::Error as ThisError;

use crate::constants::{
    PAGE_TOO_LARGE_MESSAGE, STATUS_BAD_REQUEST, STATUS_CONFLICT, STATUS_GONE,
    STATUS_INTERNAL_SERVER_ERROR, STATUS_NOT_FOUND, STATUS_PRECONDITION_FAILED,
    STATUS_REQUEST_ENTITY_TOO_LARGE, STATUS_TOO_MANY_REQUESTS, SUB_STATUS_PARTITION_KEY_RANGE_GONE,
    SUB_STATUS_READ_SESSION_NOT_AVAILABLE, SUB_STATUS_SPLITTING,
};

/// Kind of a store failure.
///
/// Store adapters compute this once at the boundary; nothing past the boundary
/// inspects messages or status codes again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreErrorKind {
    /// The addressed resource (document or partition) does not exist.
    NotFound,
    /// A session read reached a replica that has not caught up yet.
    ReadSessionNotAvailable,
    /// The partition split or is splitting; its children must be read instead.
    PartitionGone,
    /// The resource is gone for a reason other than a split.
    Gone,
    /// The request rate was too high.
    Throttled,
    /// The store failed internally or was unavailable.
    ServerError,
    /// The requested page would exceed the response size limit.
    PageTooLarge,
    /// A create hit an existing resource.
    Conflict,
    /// A conditional write lost the optimistic-concurrency race.
    PreconditionFailed,
    /// The store client gave up on an in-flight call ("operation canceled").
    Canceled,
    /// Anything not covered above.
    Other,
}

impl StoreErrorKind {
    /// Returns a string label for metrics.
    pub fn as_metric_label(&self) -> &'static str {
        match self {
            StoreErrorKind::NotFound => "not_found",
            StoreErrorKind::ReadSessionNotAvailable => "read_session_not_available",
            StoreErrorKind::PartitionGone => "partition_gone",
            StoreErrorKind::Gone => "gone",
            StoreErrorKind::Throttled => "throttled",
            StoreErrorKind::ServerError => "server_error",
            StoreErrorKind::PageTooLarge => "page_too_large",
            StoreErrorKind::Conflict => "conflict",
            StoreErrorKind::PreconditionFailed => "precondition_failed",
            StoreErrorKind::Canceled => "canceled",
            StoreErrorKind::Other => "other",
        }
    }
}

impl fmt::Display for StoreErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_metric_label())
    }
}

/// A failure reported by a store client.
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
#[error("store error ({kind}): {message}")]
pub struct StoreError {
    kind: StoreErrorKind,
    message: String,
    retry_after: Option<Duration>,
}

impl StoreError {
    /// Create an error of a known kind.
    pub fn new(kind: StoreErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    /// Build an error from the store's status and sub-status codes.
    ///
    /// # Mapping Rules
    ///
    /// | Status | Sub-status      | Kind                      |
    /// |--------|-----------------|---------------------------|
    /// | 404    | 1002            | `ReadSessionNotAvailable` |
    /// | 404    | other           | `NotFound`                |
    /// | 410    | 1002 or 1007    | `PartitionGone`           |
    /// | 410    | other           | `Gone`                    |
    /// | 429    | any             | `Throttled`               |
    /// | >= 500 | any             | `ServerError`             |
    /// | 409    | any             | `Conflict`                |
    /// | 412    | any             | `PreconditionFailed`      |
    /// | 413    | any             | `PageTooLarge`            |
    /// | 400    | page-size text  | `PageTooLarge`            |
    /// | other  | any             | `Other`                   |
    pub fn from_status(status: u16, sub_status: u32, message: impl Into<String>) -> Self {
        let message = message.into();
        let kind = match status {
            STATUS_NOT_FOUND if sub_status == SUB_STATUS_READ_SESSION_NOT_AVAILABLE => {
                StoreErrorKind::ReadSessionNotAvailable
            }
            STATUS_NOT_FOUND => StoreErrorKind::NotFound,
            STATUS_GONE
                if sub_status == SUB_STATUS_PARTITION_KEY_RANGE_GONE
                    || sub_status == SUB_STATUS_SPLITTING =>
            {
                StoreErrorKind::PartitionGone
            }
            STATUS_GONE => StoreErrorKind::Gone,
            STATUS_TOO_MANY_REQUESTS => StoreErrorKind::Throttled,
            s if s >= STATUS_INTERNAL_SERVER_ERROR => StoreErrorKind::ServerError,
            STATUS_CONFLICT => StoreErrorKind::Conflict,
            STATUS_PRECONDITION_FAILED => StoreErrorKind::PreconditionFailed,
            STATUS_REQUEST_ENTITY_TOO_LARGE => StoreErrorKind::PageTooLarge,
            STATUS_BAD_REQUEST if message.contains(PAGE_TOO_LARGE_MESSAGE) => {
                StoreErrorKind::PageTooLarge
            }
            _ => StoreErrorKind::Other,
        };
        Self::new(kind, message)
    }

    /// Attach the server-suggested delay before the next attempt.
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    /// Kind of failure.
    #[inline]
    pub fn kind(&self) -> StoreErrorKind {
        self.kind
    }

    /// Human-readable message from the store.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Server-suggested delay, if any. A zero delay counts as none.
    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after.filter(|d| !d.is_zero())
    }

    /// True for throttling and server-side failures.
    #[inline]
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            StoreErrorKind::Throttled | StoreErrorKind::ServerError
        )
    }

    /// True when a create hit an existing resource.
    #[inline]
    pub fn is_conflict(&self) -> bool {
        self.kind == StoreErrorKind::Conflict
    }

    /// True when the addressed resource does not exist.
    #[inline]
    pub fn is_not_found(&self) -> bool {
        self.kind == StoreErrorKind::NotFound
    }

    /// Shorthand for a throttling error with a retry-after hint.
    pub fn throttled(retry_after: Duration) -> Self {
        Self::new(StoreErrorKind::Throttled, "request rate is large").with_retry_after(retry_after)
    }

    /// Shorthand for a split ("gone") error.
    pub fn partition_gone(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::PartitionGone, message)
    }

    /// Shorthand for a not-found error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::NotFound, message)
    }

    /// Shorthand for a conflict error.
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::Conflict, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_status_not_found() {
        assert_eq!(
            StoreError::from_status(404, 0, "missing").kind(),
            StoreErrorKind::NotFound
        );
        assert_eq!(
            StoreError::from_status(404, 1002, "session").kind(),
            StoreErrorKind::ReadSessionNotAvailable
        );
    }

    #[test]
    fn test_from_status_gone() {
        assert_eq!(
            StoreError::from_status(410, 1002, "range gone").kind(),
            StoreErrorKind::PartitionGone
        );
        assert_eq!(
            StoreError::from_status(410, 1007, "splitting").kind(),
            StoreErrorKind::PartitionGone
        );
        assert_eq!(
            StoreError::from_status(410, 0, "gone").kind(),
            StoreErrorKind::Gone
        );
    }

    #[test]
    fn test_from_status_transient() {
        assert!(StoreError::from_status(429, 0, "throttled").is_transient());
        assert!(StoreError::from_status(500, 0, "boom").is_transient());
        assert!(StoreError::from_status(503, 0, "unavailable").is_transient());
        assert!(!StoreError::from_status(400, 0, "bad").is_transient());
    }

    #[test]
    fn test_from_status_page_too_large() {
        assert_eq!(
            StoreError::from_status(413, 0, "too big").kind(),
            StoreErrorKind::PageTooLarge
        );
        assert_eq!(
            StoreError::from_status(400, 0, "Response too big. Reduce page size and try again.")
                .kind(),
            StoreErrorKind::PageTooLarge
        );
        assert_eq!(
            StoreError::from_status(400, 0, "syntax error").kind(),
            StoreErrorKind::Other
        );
    }

    #[test]
    fn test_from_status_conditional_writes() {
        assert!(StoreError::from_status(409, 0, "exists").is_conflict());
        assert_eq!(
            StoreError::from_status(412, 0, "etag").kind(),
            StoreErrorKind::PreconditionFailed
        );
    }

    #[test]
    fn test_retry_after_zero_is_none() {
        let err = StoreError::throttled(Duration::ZERO);
        assert_eq!(err.retry_after(), None);
        let err = StoreError::throttled(Duration::from_millis(250));
        assert_eq!(err.retry_after(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_display_contains_kind_and_message() {
        let err = StoreError::partition_gone("range 3 split");
        let display = err.to_string();
        assert!(display.contains("partition_gone"));
        assert!(display.contains("range 3 split"));
    }

    #[test]
    fn test_error_is_std_error() {
        let err: Box<dyn std::error::Error> = Box::new(StoreError::not_found("lease"));
        assert!(err.to_string().contains("lease"));
    }
}
