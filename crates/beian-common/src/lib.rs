//! # Beian Common
//!
//! Shared types, errors, and constants used by the Beian Warden credential engine.
//!
//! ## Modules
//! - `types` - Core data structures (Credential, DetectionBox, MatchedPoint, ...)
//! - `error` - Error taxonomy for acquisition, transport, and queries
//! - `constants` - Endpoints, header names, thresholds, and default timings

pub mod constants;
pub mod error;
pub mod types;

pub use error::{AcquisitionError, QueryError, StoreError, TransportError};
pub use types::*;
