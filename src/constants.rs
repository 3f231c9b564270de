//! Centralized defaults and protocol constants.
//!
//! Every tunable default used by [`ProcessorConfig`](crate::feed::ProcessorConfig)
//! and the status codes used to classify store failures live here so they can be
//! reviewed and changed in one place.
//!
//! # Categories
//!
//! - **Lease timing**: renewal, acquisition and expiration intervals
//! - **Feed reading**: poll delay and page sizes
//! - **Bootstrap**: initialization lock and retry sleep
//! - **Store status codes**: HTTP-like codes reported by the source store

// =============================================================================
// Lease Timing
// =============================================================================

/// Default interval between lease renewals for owned partitions.
pub const DEFAULT_LEASE_RENEW_INTERVAL_SECS: u64 = 17;

/// Default interval between load-balancing passes that try to take leases.
pub const DEFAULT_LEASE_ACQUIRE_INTERVAL_SECS: u64 = 13;

/// Default time after which a lease that has not been renewed is considered expired.
pub const DEFAULT_LEASE_EXPIRATION_INTERVAL_SECS: u64 = 60;

/// Multiplier applied to the lease expiration interval before sustained
/// unhealthiness escalates to the terminal strategy.
pub const DEFAULT_UNHEALTHINESS_MULTIPLIER: u32 = 5;

// =============================================================================
// Feed Reading
// =============================================================================

/// Default delay between polls once a partition has been fully drained.
pub const DEFAULT_FEED_POLL_DELAY_SECS: u64 = 5;

/// Page size used to seed degradation when no page size was configured.
pub const DEFAULT_MAX_ITEM_COUNT: u32 = 100;

/// Smallest page size. A page-too-large failure at this size is fatal.
pub const MIN_MAX_ITEM_COUNT: u32 = 1;

/// Default page size when listing the partition topology.
pub const DEFAULT_QUERY_PARTITIONS_MAX_BATCH_SIZE: u32 = 100;

/// Default fan-out for lease creation and remaining-work estimation.
pub const DEFAULT_DEGREE_OF_PARALLELISM: usize = 25;

/// Document property carrying the logical sequence number of a change.
pub const LSN_PROPERTY_NAME: &str = "_lsn";

// =============================================================================
// Bootstrap
// =============================================================================

/// Default lifetime of the bootstrap lock document.
pub const DEFAULT_BOOTSTRAP_LOCK_TIME_SECS: u64 = 30;

/// Default sleep between bootstrap attempts while another host holds the lock.
pub const DEFAULT_BOOTSTRAP_SLEEP_TIME_SECS: u64 = 15;

/// Default prefix for lease and marker documents.
pub const DEFAULT_LEASE_PREFIX: &str = "";

/// Suffix of the document marking the lease store as initialized.
pub const INITIALIZED_MARKER_SUFFIX: &str = ".info";

/// Suffix of the self-expiring bootstrap lock document.
pub const LOCK_MARKER_SUFFIX: &str = ".lock";

/// Separator between the lease prefix and the partition id in lease ids.
pub const LEASE_ID_SEPARATOR: &str = "..";

// =============================================================================
// Store Status Codes
// =============================================================================

/// Malformed request; combined with a page-size message it means page too large.
pub const STATUS_BAD_REQUEST: u16 = 400;

/// Resource not found.
pub const STATUS_NOT_FOUND: u16 = 404;

/// Create of an existing resource.
pub const STATUS_CONFLICT: u16 = 409;

/// Resource is gone (partition split or moved).
pub const STATUS_GONE: u16 = 410;

/// Conditional write failed (version/etag mismatch).
pub const STATUS_PRECONDITION_FAILED: u16 = 412;

/// Response would exceed the maximum payload size.
pub const STATUS_REQUEST_ENTITY_TOO_LARGE: u16 = 413;

/// Request rate too large.
pub const STATUS_TOO_MANY_REQUESTS: u16 = 429;

/// First server-side failure code.
pub const STATUS_INTERNAL_SERVER_ERROR: u16 = 500;

/// Sub-status for a session read that is not yet available (with 404) or a
/// partition range that no longer exists (with 410).
pub const SUB_STATUS_READ_SESSION_NOT_AVAILABLE: u32 = 1002;

/// Sub-status for a partition range that has gone away.
pub const SUB_STATUS_PARTITION_KEY_RANGE_GONE: u32 = 1002;

/// Sub-status for a partition that is in the middle of splitting.
pub const SUB_STATUS_SPLITTING: u32 = 1007;

/// Message fragment the store uses when the requested page is too large.
pub const PAGE_TOO_LARGE_MESSAGE: &str = "Reduce page size and try again.";
