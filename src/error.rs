//! Error taxonomy for the metadata cache core.
//!
//! Each failure class carries an explicit retryable/terminal meaning that the
//! request client and sync scheduler inspect — retry policy is driven by
//! matching on these values, never by catching and re-classifying strings.
//! Query misses are not errors; lookups return `Option::None`.

use std::time::Duration;

use thiserror::Error;

/// Credential exchange or repeated authorization failure.
///
/// Terminal for the current request. The token manager never retries an
/// exchange internally; retry policy lives in the request client.
#[derive(Debug, Clone, Error)]
pub enum AuthError {
    /// The identity provider rejected the client-credentials grant.
    #[error("token exchange failed with status {status}: {body}")]
    Exchange { status: u16, body: String },

    /// The identity provider could not be reached at all.
    #[error("token endpoint unreachable: {reason}")]
    Endpoint { reason: String },

    /// The token endpoint answered 200 but the payload was not a token.
    #[error("malformed token response: {reason}")]
    MalformedResponse { reason: String },

    /// The remote API rejected a request twice with 401, once before and
    /// once after a forced credential refresh.
    #[error("request rejected as unauthorized after credential refresh")]
    Unauthorized,
}

/// Outcome of an outbound API call after the retry envelope is exhausted.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// Connection failure, timeout, or 5xx — the retryable class.
    /// `received_response` distinguishes "the wire dropped before any bytes
    /// came back" from "the remote answered with a retryable status", which
    /// matters for non-idempotent requests.
    #[error("transient failure after retries: {reason}")]
    Transient {
        reason: String,
        received_response: bool,
    },

    /// A definitive non-auth, non-retryable status from the remote.
    #[error("remote returned status {status}: {body}")]
    Status { status: u16, body: String },
}

impl RequestError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RequestError::Transient { .. })
    }
}

/// Fatal document-envelope failure. Aborts the whole sync cycle.
///
/// Per-record problems inside a valid envelope are not errors; the parser
/// skips them and records a warning instead.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid document envelope: {0}")]
    InvalidEnvelope(String),

    #[error("malformed xml: {0}")]
    Xml(#[from] quick_xml::Error),
}

/// Storage I/O or transaction failure.
///
/// Aborts the current batch only; previously committed batches stay intact
/// and continue to be served.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database failure: {0}")]
    Db(#[from] sqlx::Error),

    #[error("database path unusable: {0}")]
    Io(#[from] std::io::Error),
}

/// Union surfaced by a sync cycle to the scheduler, which decides between
/// backoff-and-retry and the `Failed` state.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Request(#[from] RequestError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Cold-start wait outcome for callers that block on the first sync.
#[derive(Debug, Error)]
pub enum ReadyError {
    #[error("no successful sync within {0:?}")]
    Timeout(Duration),

    #[error("scheduler shut down before the first successful sync")]
    Closed,
}
