//! Challenge-response orchestration.
//!
//! One acquisition walks
//! `Authenticating → FetchingChallenge → Solving → Submitting → Signed | Failed`.
//! The two leading round-trips are retried immediately up to a fixed bound;
//! solving and submission are not retried here. Callers wanting more
//! resilience wrap the whole run with [`acquire_with_retries`].

use async_trait::async_trait;
use beian_common::constants::{AUTH_KEY_PREFIX, CLIENT_UID_PREFIX, ROUND_TRIP_ATTEMPTS};
use beian_common::{AcquisitionError, Credential, TransportError};
use md5::{Digest, Md5};
use std::future::Future;
use std::sync::Arc;

use super::client::{Challenge, ChallengeApi, VerifyRequest};
use crate::solver::{SolveError, Solver, Targets};

/// Orchestration stage, for logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Authenticating,
    FetchingChallenge,
    Solving,
    Submitting,
    Signed,
    Failed,
}

/// Turns challenge material into an encrypted point payload
pub trait ChallengeSolver: Send + Sync {
    fn solve(&self, challenge: &Challenge) -> Result<String, SolveError>;
}

impl ChallengeSolver for Solver {
    fn solve(&self, challenge: &Challenge) -> Result<String, SolveError> {
        // Prefer rendered words when the challenge names them and a font is
        // loaded; otherwise fall back to the reference image
        let targets = match challenge.small_image.as_deref() {
            _ if !challenge.word_list.is_empty() && self.renders_text() => {
                Targets::Words(&challenge.word_list)
            }
            Some(reference) => Targets::Reference(reference),
            None if !challenge.word_list.is_empty() => return Err(SolveError::NoGlyphFont),
            None => {
                return Err(SolveError::Decode("challenge carries no reference image".into()));
            }
        };
        Solver::solve(self, &challenge.big_image, targets, &challenge.secret_key)
    }
}

/// Anything that can produce one fresh credential
#[async_trait]
pub trait CredentialAcquirer: Send + Sync {
    async fn acquire(&self) -> Result<Credential, AcquisitionError>;
}

/// `md5(prefix + timestamp)` as lowercase hex
pub fn auth_key(timestamp: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(AUTH_KEY_PREFIX.as_bytes());
    hasher.update(timestamp.as_bytes());
    hex::encode(hasher.finalize())
}

pub struct ChallengeOrchestrator {
    api: Arc<dyn ChallengeApi>,
    solver: Arc<dyn ChallengeSolver>,
    round_trip_attempts: u32,
}

impl ChallengeOrchestrator {
    pub fn new(api: Arc<dyn ChallengeApi>, solver: Arc<dyn ChallengeSolver>) -> Self {
        Self {
            api,
            solver,
            round_trip_attempts: ROUND_TRIP_ATTEMPTS,
        }
    }

    /// Run one acquisition attempt end to end
    pub async fn run(&self) -> Result<Credential, AcquisitionError> {
        let result = self.run_stages().await;
        match &result {
            Ok(credential) => {
                tracing::info!(stage = ?Stage::Signed, credential_id = %credential.id, "Credential signed");
            }
            Err(e) => {
                tracing::warn!(stage = ?Stage::Failed, kind = e.kind(), error = %e, "Acquisition failed");
            }
        }
        result
    }

    async fn run_stages(&self) -> Result<Credential, AcquisitionError> {
        tracing::debug!(stage = ?Stage::Authenticating);
        let token = retry_round_trip(self.round_trip_attempts, Stage::Authenticating, || {
            let timestamp = chrono::Utc::now().timestamp().to_string();
            let api = self.api.clone();
            async move { api.authenticate(&auth_key(&timestamp), &timestamp).await }
        })
        .await
        .map_err(|(attempts, source)| AcquisitionError::AuthenticationFailed { attempts, source })?;

        tracing::debug!(stage = ?Stage::FetchingChallenge);
        let client_uid = format!("{CLIENT_UID_PREFIX}{}", uuid::Uuid::new_v4());
        let challenge = retry_round_trip(self.round_trip_attempts, Stage::FetchingChallenge, || {
            self.api.fetch_challenge(&token, &client_uid)
        })
        .await
        .map_err(|(attempts, source)| AcquisitionError::ChallengeFetchFailed { attempts, source })?;

        tracing::debug!(stage = ?Stage::Solving, challenge_id = %challenge.uuid);
        let point_json = self.solve(challenge.clone()).await?;

        tracing::debug!(stage = ?Stage::Submitting, challenge_id = %challenge.uuid);
        let request = VerifyRequest {
            challenge_id: &challenge.uuid,
            secret_key: &challenge.secret_key,
            client_uid: &client_uid,
            point_json: &point_json,
            auth_token: &token,
        };
        let response = self
            .api
            .verify(&request)
            .await
            .map_err(|e| AcquisitionError::SubmissionFailed(e.to_string()))?;

        if response.code != 200 {
            return Err(AcquisitionError::SubmissionFailed(format!(
                "verification code {}: {}",
                response.code, response.msg
            )));
        }
        let sign = match response.sign {
            Some(sign) if !sign.is_empty() => sign,
            _ => return Err(AcquisitionError::SignatureMissing(response.msg)),
        };

        Ok(Credential::new(challenge.uuid, token, sign))
    }

    /// Perception is CPU-bound; keep it off the async workers
    async fn solve(&self, challenge: Challenge) -> Result<String, AcquisitionError> {
        let solver = self.solver.clone();
        tokio::task::spawn_blocking(move || solver.solve(&challenge))
            .await
            .map_err(|e| AcquisitionError::SolvingFailed(format!("solver task failed: {e}")))?
            .map_err(|e| AcquisitionError::SolvingFailed(e.to_string()))
    }
}

#[async_trait]
impl CredentialAcquirer for ChallengeOrchestrator {
    async fn acquire(&self) -> Result<Credential, AcquisitionError> {
        self.run().await
    }
}

/// Immediate retries of one round-trip; yields the attempt count and last
/// error once the bound is exhausted
async fn retry_round_trip<T, F, Fut>(
    attempts: u32,
    stage: Stage,
    mut op: F,
) -> Result<T, (u32, TransportError)>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TransportError>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= attempts => return Err((attempts, e)),
            Err(e) => {
                tracing::warn!(stage = ?stage, attempt, error = %e, "Round-trip failed, retrying");
                attempt += 1;
            }
        }
    }
}

/// Caller-level policy: re-run a whole acquisition up to `attempts` times,
/// stopping at the first success
pub async fn acquire_with_retries(
    acquirer: &dyn CredentialAcquirer,
    attempts: u32,
) -> Result<Credential, AcquisitionError> {
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match acquirer.acquire().await {
            Ok(credential) => return Ok(credential),
            Err(e) if attempt >= attempts => {
                return Err(AcquisitionError::Exhausted {
                    attempts,
                    last: Box::new(e),
                });
            }
            Err(e) => {
                tracing::error!(attempt, error = %e, "Credential acquisition attempt failed");
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::protocol::client::VerifyResponse;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Scripted remote side
    #[derive(Default)]
    pub(crate) struct FakeApi {
        pub auth_failures: u32,
        pub fetch_failures: u32,
        pub verify_code: Option<i64>,
        pub omit_sign: bool,
        pub challenge: Option<Challenge>,
        pub auth_calls: AtomicU32,
        pub fetch_calls: AtomicU32,
        pub verify_calls: AtomicU32,
        pub fetched_uids: Mutex<Vec<String>>,
        pub submitted: Mutex<Vec<(String, String, String, String)>>,
    }

    #[async_trait]
    impl ChallengeApi for FakeApi {
        async fn authenticate(&self, auth_key: &str, timestamp: &str) -> Result<String, TransportError> {
            let call = self.auth_calls.fetch_add(1, Ordering::SeqCst) + 1;
            assert_eq!(auth_key, super::auth_key(timestamp));
            if call <= self.auth_failures {
                return Err(TransportError::Http("connection reset".into()));
            }
            Ok("auth-token".into())
        }

        async fn fetch_challenge(
            &self,
            token: &str,
            client_uid: &str,
        ) -> Result<Challenge, TransportError> {
            let call = self.fetch_calls.fetch_add(1, Ordering::SeqCst) + 1;
            assert_eq!(token, "auth-token");
            self.fetched_uids.lock().unwrap().push(client_uid.to_string());
            if call <= self.fetch_failures {
                return Err(TransportError::Malformed("missing params".into()));
            }
            Ok(self.challenge.clone().unwrap_or_else(|| Challenge {
                uuid: "challenge-1".into(),
                secret_key: "0123456789abcdef".into(),
                big_image: "big".into(),
                small_image: Some("small".into()),
                word_list: Vec::new(),
            }))
        }

        async fn verify(&self, request: &VerifyRequest<'_>) -> Result<VerifyResponse, TransportError> {
            self.verify_calls.fetch_add(1, Ordering::SeqCst);
            self.submitted.lock().unwrap().push((
                request.challenge_id.to_string(),
                request.client_uid.to_string(),
                request.point_json.to_string(),
                request.auth_token.to_string(),
            ));
            Ok(VerifyResponse {
                code: self.verify_code.unwrap_or(200),
                msg: "ok".into(),
                sign: (!self.omit_sign).then(|| "signature".to_string()),
            })
        }
    }

    pub(crate) struct FakeSolver {
        pub fail: bool,
        pub calls: AtomicU32,
    }

    impl FakeSolver {
        pub(crate) fn ok() -> Arc<Self> {
            Arc::new(Self { fail: false, calls: AtomicU32::new(0) })
        }
    }

    impl ChallengeSolver for FakeSolver {
        fn solve(&self, _: &Challenge) -> Result<String, SolveError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(SolveError::InsufficientBoxes { found: 3, expected: 5 });
            }
            Ok("encrypted-points".into())
        }
    }

    fn orchestrator(api: Arc<FakeApi>, solver: Arc<dyn ChallengeSolver>) -> ChallengeOrchestrator {
        ChallengeOrchestrator::new(api, solver)
    }

    #[test]
    fn test_auth_key_is_md5_of_prefixed_timestamp() {
        assert_eq!(auth_key("1700000000"), "df55771dcc26acd5f7312c283cefb44c");
    }

    #[tokio::test]
    async fn test_successful_run_packages_credential() {
        let api = Arc::new(FakeApi::default());
        let credential = orchestrator(api.clone(), FakeSolver::ok()).run().await.unwrap();

        assert_eq!(credential.id, "challenge-1");
        assert_eq!(credential.token, "auth-token");
        assert_eq!(credential.sign, "signature");
        assert_eq!(credential.rci, None);

        let submitted = api.submitted.lock().unwrap();
        let (challenge_id, client_uid, point_json, auth_token) = &submitted[0];
        assert_eq!(challenge_id, "challenge-1");
        assert!(client_uid.starts_with("point-"));
        assert_eq!(client_uid, &api.fetched_uids.lock().unwrap()[0]);
        assert_eq!(point_json, "encrypted-points");
        assert_eq!(auth_token, "auth-token");
    }

    #[tokio::test]
    async fn test_authentication_is_retried() {
        let api = Arc::new(FakeApi { auth_failures: 2, ..Default::default() });
        let result = orchestrator(api.clone(), FakeSolver::ok()).run().await;

        assert!(result.is_ok());
        assert_eq!(api.auth_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_authentication_gives_up_after_three_attempts() {
        let api = Arc::new(FakeApi { auth_failures: 3, ..Default::default() });
        let err = orchestrator(api.clone(), FakeSolver::ok()).run().await.unwrap_err();

        assert_eq!(
            err,
            AcquisitionError::AuthenticationFailed {
                attempts: 3,
                source: TransportError::Http("connection reset".into()),
            }
        );
        assert_eq!(api.fetch_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_challenge_fetch_gives_up_after_three_attempts() {
        let api = Arc::new(FakeApi { fetch_failures: 3, ..Default::default() });
        let err = orchestrator(api.clone(), FakeSolver::ok()).run().await.unwrap_err();

        assert!(matches!(err, AcquisitionError::ChallengeFetchFailed { attempts: 3, .. }));
        assert_eq!(api.fetch_calls.load(Ordering::SeqCst), 3);
        assert_eq!(api.verify_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_solving_failure_is_not_retried() {
        let api = Arc::new(FakeApi::default());
        let solver = Arc::new(FakeSolver { fail: true, calls: AtomicU32::new(0) });
        let err = orchestrator(api.clone(), solver.clone()).run().await.unwrap_err();

        assert_eq!(err.kind(), "solving_failed");
        assert!(err.to_string().contains("only 3 of 5"));
        assert_eq!(solver.calls.load(Ordering::SeqCst), 1);
        assert_eq!(api.verify_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_rejected_submission() {
        let api = Arc::new(FakeApi { verify_code: Some(500), ..Default::default() });
        let err = orchestrator(api, FakeSolver::ok()).run().await.unwrap_err();
        assert_eq!(err.kind(), "submission_failed");
    }

    #[tokio::test]
    async fn test_missing_signature() {
        let api = Arc::new(FakeApi { omit_sign: true, ..Default::default() });
        let err = orchestrator(api, FakeSolver::ok()).run().await.unwrap_err();
        assert_eq!(err, AcquisitionError::SignatureMissing("ok".into()));
    }

    #[tokio::test]
    async fn test_real_solver_pipeline_feeds_submission() {
        use crate::solver::encrypt_points;
        use crate::solver::tests::{challenge_images, patch_centres, solver};
        use beian_common::MatchedPoint;

        let (background, reference) = challenge_images();
        let api = Arc::new(FakeApi {
            challenge: Some(Challenge {
                uuid: "challenge-9".into(),
                secret_key: "0123456789abcdef".into(),
                big_image: background,
                small_image: Some(reference),
                word_list: Vec::new(),
            }),
            ..Default::default()
        });

        let credential = orchestrator(api.clone(), Arc::new(solver(patch_centres(), 4)))
            .run()
            .await
            .unwrap();
        assert_eq!(credential.id, "challenge-9");

        let expected: Vec<MatchedPoint> = [3, 0, 2, 1]
            .iter()
            .map(|&i| MatchedPoint { x: 60 + i * 120, y: 80 })
            .collect();
        let submitted = api.submitted.lock().unwrap();
        assert_eq!(submitted[0].2, encrypt_points(&expected, "0123456789abcdef").unwrap());
    }

    #[test]
    fn test_words_without_font_fall_back_to_reference() {
        use crate::solver::tests::{challenge_images, patch_centres, solver};

        let (background, reference) = challenge_images();
        let solver = solver(patch_centres(), 4);
        let mut challenge = Challenge {
            uuid: "c".into(),
            secret_key: "0123456789abcdef".into(),
            big_image: background,
            small_image: Some(reference),
            word_list: vec!["各".into(), "地".into()],
        };

        assert!(ChallengeSolver::solve(&solver, &challenge).is_ok());

        challenge.small_image = None;
        assert!(matches!(
            ChallengeSolver::solve(&solver, &challenge),
            Err(SolveError::NoGlyphFont)
        ));
    }

    /// Fails a fixed number of times, then issues credentials
    pub(crate) struct FlakyAcquirer {
        pub failures: u32,
        pub calls: AtomicU32,
    }

    impl FlakyAcquirer {
        pub(crate) fn new(failures: u32) -> Arc<Self> {
            Arc::new(Self { failures, calls: AtomicU32::new(0) })
        }
    }

    #[async_trait]
    impl CredentialAcquirer for FlakyAcquirer {
        async fn acquire(&self) -> Result<Credential, AcquisitionError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                return Err(AcquisitionError::SolvingFailed(format!("attempt {call}")));
            }
            Ok(Credential::new(format!("cred-{call}"), "token", "sign"))
        }
    }

    #[tokio::test]
    async fn test_caller_retry_stops_at_first_success() {
        let acquirer = FlakyAcquirer::new(2);
        let credential = acquire_with_retries(acquirer.as_ref(), 5).await.unwrap();

        assert_eq!(credential.id, "cred-3");
        assert_eq!(acquirer.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_caller_retry_exhaustion_is_structured() {
        let acquirer = FlakyAcquirer::new(u32::MAX);
        let err = acquire_with_retries(acquirer.as_ref(), 5).await.unwrap_err();

        assert_eq!(
            err,
            AcquisitionError::Exhausted {
                attempts: 5,
                last: Box::new(AcquisitionError::SolvingFailed("attempt 5".into())),
            }
        );
        assert_eq!(acquirer.calls.load(Ordering::SeqCst), 5);
    }
}
