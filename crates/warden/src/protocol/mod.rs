//! Remote challenge/verification protocol.

mod client;
mod orchestrator;

pub use client::{IcpClient, QueryApi, QueryRequest, QueryResponse};
pub use orchestrator::{ChallengeOrchestrator, CredentialAcquirer, acquire_with_retries};

#[cfg(test)]
pub(crate) use orchestrator::tests::FlakyAcquirer;
