//! Consumer-facing credential acquisition.

use beian_common::{AcquisitionError, Credential, CredentialPatch, QueryError, StoreError};
use std::sync::Arc;
use std::time::Duration;

use crate::protocol::{CredentialAcquirer, acquire_with_retries};
use crate::store::CredentialStore;

/// Hands out credentials from the store, acquiring fresh ones on demand
pub struct CredentialBroker {
    store: Arc<CredentialStore>,
    acquirer: Arc<dyn CredentialAcquirer>,
    /// Caller-level attempts around a whole acquisition
    attempts: u32,
    /// TTL applied when serving consumer reads
    serve_ttl: Duration,
}

impl CredentialBroker {
    pub fn new(
        store: Arc<CredentialStore>,
        acquirer: Arc<dyn CredentialAcquirer>,
        attempts: u32,
        serve_ttl: Duration,
    ) -> Self {
        Self {
            store,
            acquirer,
            attempts,
            serve_ttl,
        }
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    pub fn serve_ttl(&self) -> Duration {
        self.serve_ttl
    }

    /// Acquire a fresh credential and store it
    pub async fn acquire_credential(&self) -> Result<Credential, AcquisitionError> {
        let credential = acquire_with_retries(self.acquirer.as_ref(), self.attempts).await?;

        // The credential is still usable by this caller if persisting fails
        if let Err(e) = self.store.insert(credential.clone()).await {
            tracing::error!(credential_id = %credential.id, error = %e, "Failed to store credential");
        }
        Ok(credential)
    }

    /// Evict a credential the remote side refused. Unknown ids are a no-op.
    pub async fn report_rejected(&self, id: &str) -> Result<bool, StoreError> {
        let removed = self.store.delete(id).await?;
        if removed {
            tracing::info!(credential_id = %id, "Evicted rejected credential");
        } else {
            tracing::debug!(credential_id = %id, "Rejected credential was not stored");
        }
        Ok(removed)
    }

    pub async fn get_credential(&self, ttl: Duration) -> Result<Option<Credential>, StoreError> {
        self.store.pick_random_live(ttl).await
    }

    /// Merge fields returned by the remote side into a stored credential
    pub async fn refresh(&self, id: &str, patch: CredentialPatch) -> Result<bool, StoreError> {
        if patch.is_empty() {
            return Ok(false);
        }
        self.store.update(id, patch).await
    }

    /// A live credential at the serving TTL, or a freshly acquired one
    pub async fn credential_for_query(&self) -> Result<Credential, QueryError> {
        match self.get_credential(self.serve_ttl).await {
            Ok(Some(credential)) => return Ok(credential),
            Ok(None) => tracing::debug!("No live credential, acquiring"),
            Err(e) => tracing::warn!(error = %e, "Credential store unreadable, acquiring"),
        }
        Ok(self.acquire_credential().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FlakyAcquirer;
    use crate::store::tests::ManualClock;
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;

    fn broker(dir: &TempDir, acquirer: Arc<FlakyAcquirer>) -> CredentialBroker {
        let store = CredentialStore::with_clock(
            dir.path().join("token_cache.json"),
            Duration::from_secs(600),
            Arc::new(ManualClock::new()),
        );
        CredentialBroker::new(Arc::new(store), acquirer, 5, Duration::from_secs(180))
    }

    #[tokio::test]
    async fn test_acquire_credential_stores_result() {
        let dir = TempDir::new().unwrap();
        let broker = broker(&dir, FlakyAcquirer::new(1));

        let credential = broker.acquire_credential().await.unwrap();

        assert_eq!(credential.id, "cred-2");
        let stored = broker.get_credential(Duration::from_secs(180)).await.unwrap();
        assert_eq!(stored.map(|c| c.id), Some("cred-2".to_string()));
    }

    #[tokio::test]
    async fn test_exhaustion_is_a_structured_error() {
        let dir = TempDir::new().unwrap();
        let broker = broker(&dir, FlakyAcquirer::new(u32::MAX));

        let err = broker.credential_for_query().await.unwrap_err();
        assert_eq!(err.kind(), "acquisition_exhausted");
        assert_eq!(err.status_code(), 503);
    }

    #[tokio::test]
    async fn test_report_rejected_unknown_id_is_noop() {
        let dir = TempDir::new().unwrap();
        let broker = broker(&dir, FlakyAcquirer::new(0));

        assert!(!tokio_test::assert_ok!(broker.report_rejected("never-issued").await));
    }

    #[tokio::test]
    async fn test_report_rejected_evicts() {
        let dir = TempDir::new().unwrap();
        let broker = broker(&dir, FlakyAcquirer::new(0));

        let credential = broker.acquire_credential().await.unwrap();
        assert!(broker.report_rejected(&credential.id).await.unwrap());
        assert_eq!(broker.get_credential(Duration::from_secs(180)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_credential_for_query_prefers_stored() {
        let dir = TempDir::new().unwrap();
        let acquirer = FlakyAcquirer::new(0);
        let broker = broker(&dir, acquirer.clone());

        let first = broker.credential_for_query().await.unwrap();
        let second = broker.credential_for_query().await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(acquirer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refresh_ignores_empty_patch() {
        let dir = TempDir::new().unwrap();
        let broker = broker(&dir, FlakyAcquirer::new(0));
        let credential = broker.acquire_credential().await.unwrap();

        assert!(!broker.refresh(&credential.id, CredentialPatch::default()).await.unwrap());
        assert!(broker.refresh(&credential.id, CredentialPatch::rci("r1")).await.unwrap());
    }
}
