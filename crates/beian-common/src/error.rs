//! Error taxonomy for credential acquisition and queries.

use thiserror::Error;

/// A failed round-trip to the remote API
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Request could not be sent or its body could not be read
    #[error("HTTP error: {0}")]
    Http(String),

    /// Remote side answered with a non-success HTTP status
    #[error("unexpected HTTP status {0}")]
    Status(u16),

    /// Response body did not have the expected shape
    #[error("malformed response: {0}")]
    Malformed(String),
}

/// Failure of one credential acquisition.
///
/// Stage failures carry the last underlying cause; `Exhausted` wraps the last
/// stage failure once a caller-level retry loop gives up.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AcquisitionError {
    #[error("authentication failed after {attempts} attempts: {source}")]
    AuthenticationFailed { attempts: u32, source: TransportError },

    #[error("challenge fetch failed after {attempts} attempts: {source}")]
    ChallengeFetchFailed { attempts: u32, source: TransportError },

    /// Localization came up short or the matcher failed
    #[error("solving failed: {0}")]
    SolvingFailed(String),

    /// Verification endpoint rejected the answer or could not be reached
    #[error("submission failed: {0}")]
    SubmissionFailed(String),

    /// Verification succeeded but carried no signature
    #[error("signature missing: {0}")]
    SignatureMissing(String),

    #[error("credential acquisition exhausted after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        last: Box<AcquisitionError>,
    },
}

impl AcquisitionError {
    /// Stable machine-readable code
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AuthenticationFailed { .. } => "authentication_failed",
            Self::ChallengeFetchFailed { .. } => "challenge_fetch_failed",
            Self::SolvingFailed(_) => "solving_failed",
            Self::SubmissionFailed(_) => "submission_failed",
            Self::SignatureMissing(_) => "signature_missing",
            Self::Exhausted { .. } => "acquisition_exhausted",
        }
    }

    /// Returns the HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        match self {
            Self::SolvingFailed(_) => 500,
            Self::Exhausted { .. } => 503,
            _ => 502,
        }
    }

    /// Returns true if re-running the whole acquisition may succeed
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Exhausted { .. })
    }

    /// The innermost stage failure
    pub fn root(&self) -> &AcquisitionError {
        match self {
            Self::Exhausted { last, .. } => last.root(),
            other => other,
        }
    }
}

/// Failure of a business query
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueryError {
    /// A required request field was missing or empty
    #[error("missing required field: {field}")]
    Validation { field: &'static str },

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Remote side answered with a non-200 business code
    #[error("query rejected ({code}): {msg}")]
    Rejected { code: i64, msg: String },

    #[error(transparent)]
    Acquisition(#[from] AcquisitionError),
}

impl QueryError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation_error",
            Self::Transport(_) => "transport_error",
            Self::Rejected { .. } => "query_rejected",
            Self::Acquisition(e) => e.kind(),
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation { .. } => 400,
            Self::Transport(_) => 502,
            Self::Rejected { .. } => 502,
            Self::Acquisition(e) => e.status_code(),
        }
    }
}

/// Failure to persist the credential snapshot.
///
/// A snapshot that cannot be parsed is not an error: it is discarded and
/// treated as empty.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("snapshot I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode snapshot: {0}")]
    Encode(#[from] serde_json::Error),
}
