//! Job negotiation engine
//!
//! A [`Job`] drives one model/version through the cycle handshake:
//!
//! ```text
//! start() -> admission -> authenticate -> [probe metrics] -> cycle request
//!         -> fetch plan + model -> Ready | Rejected | Failed
//! ```
//!
//! Each call to [`Job::start`] is a fresh run with its own state channel,
//! outcome and session ids. A [`ReadyCycle`] reports under the ids of the run
//! that produced it; [`Job::reporter`] follows whichever run started last.
//! The transport is released when a run ends and after every report, so a
//! socket-mode job holds no signaling connection while idle.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use fedlink_core::config::{ClientConfig, JobConfig};
use fedlink_core::identity::{ArtifactId, RequestKey, WorkerId};
use fedlink_core::state::NegotiationState;
use fedlink_core::traits::{DeviceMonitor, StaticDevice};
use fedlink_core::{Error, Result};
use fedlink_models::diff::DiffReport;
use fedlink_models::executor::{PlanArtifact, PlanExecutor, TrainingLoop, TrainingSummary};
use fedlink_models::{ModelCodec, ModelState, PostcardCodec, Tensor};
use fedlink_net::protocol::{AuthReply, AuthRequest, CycleRequest, CycleResponse, ReportRequest};
use fedlink_net::traits::{ArtifactSource, CoordinatorTransport, SpeedTest};
use fedlink_runtime::{Clock, Deadline, SystemClock};
use tokio::sync::{oneshot, watch};

use crate::admission::AdmissionController;
use crate::fetch::ArtifactFetcher;
use crate::metrics::{ConnectionMetricsProber, HostProbe, TcpHostProbe};

/// Worker id and request key of one run
#[derive(Debug, Default)]
pub struct SessionIds {
    inner: StdMutex<(Option<WorkerId>, Option<RequestKey>)>,
}

impl SessionIds {
    fn set_worker_id(&self, worker_id: WorkerId) {
        if let Ok(mut ids) = self.inner.lock() {
            ids.0 = Some(worker_id);
        }
    }

    fn set_request_key(&self, request_key: RequestKey) {
        if let Ok(mut ids) = self.inner.lock() {
            ids.1 = Some(request_key);
        }
    }

    /// Both ids, once the cycle has been accepted
    pub fn get(&self) -> Option<(WorkerId, RequestKey)> {
        let ids = self.inner.lock().ok()?;
        match &*ids {
            (Some(worker_id), Some(request_key)) => Some((worker_id.clone(), request_key.clone())),
            _ => None,
        }
    }
}

/// Ids of the run a job started most recently
type CurrentRun = Arc<StdMutex<Arc<SessionIds>>>;

#[derive(Clone)]
enum IdSource {
    Latest(CurrentRun),
    Run(Arc<SessionIds>),
}

impl IdSource {
    fn get(&self) -> Option<(WorkerId, RequestKey)> {
        match self {
            IdSource::Latest(current) => current.lock().ok()?.get(),
            IdSource::Run(ids) => ids.get(),
        }
    }
}

/// Sends diffs for an accepted cycle
#[derive(Clone)]
pub struct DiffReporter {
    transport: Arc<dyn CoordinatorTransport>,
    codec: Arc<dyn ModelCodec>,
    ids: IdSource,
}

impl core::fmt::Debug for DiffReporter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DiffReporter").field("ids", &self.ids.get()).finish()
    }
}

impl DiffReporter {
    /// Report `diff`.
    ///
    /// Returns `Ok(false)` without sending anything while the worker id or
    /// request key is still unknown.
    pub async fn report(&self, diff: &DiffReport) -> Result<bool> {
        let Some((worker_id, request_key)) = self.ids.get() else {
            tracing::warn!("diff report ignored: cycle has not been accepted yet");
            return Ok(false);
        };
        let request = ReportRequest {
            worker_id,
            request_key,
            diff: diff.to_base64(self.codec.as_ref())?,
        };
        let reply = self.transport.report(&request).await;
        self.transport.release().await;
        let reply = reply?;
        if let Some(error) = reply.error {
            return Err(Error::network(error));
        }
        tracing::info!(worker_id = %request.worker_id, status = ?reply.status, "diff reported");
        Ok(true)
    }
}

/// Everything the caller needs once a cycle is ready
#[derive(Debug, Clone)]
pub struct ReadyCycle {
    /// Authenticated worker
    pub worker_id: WorkerId,
    /// Key of the accepted cycle
    pub request_key: RequestKey,
    /// Training plan
    pub plan: PlanArtifact,
    /// Model id of the downloaded parameters
    pub model_id: ArtifactId,
    /// Parameters before training
    pub model: ModelState,
    /// Lowercase hex sha256 of the model container as downloaded
    pub model_sha256: String,
    /// Hyperparameters for this cycle
    pub client_config: ClientConfig,
    reporter: DiffReporter,
}

impl ReadyCycle {
    /// Reporter bound to this cycle's transport
    pub fn reporter(&self) -> &DiffReporter {
        &self.reporter
    }

    /// Run `executor` over `batches` on a blocking thread, stopping between
    /// batches once `deadline` expires
    pub async fn train<E, I>(&self, mut executor: E, batches: I, deadline: Deadline) -> Result<TrainingSummary>
    where
        E: PlanExecutor + 'static,
        I: IntoIterator<Item = Vec<Tensor>> + Send + 'static,
    {
        let plan = self.plan.clone();
        let config = self.client_config.clone();
        let initial = self.model.clone();
        tokio::task::spawn_blocking(move || {
            TrainingLoop::new(&plan, &config)
                .with_deadline(deadline)
                .run(&mut executor, initial, batches)
        })
        .await
        .map_err(|e| Error::Executor(format!("training task failed: {e}")))?
    }

    /// Diff `updated` against the downloaded parameters and report it
    pub async fn report_updated(&self, updated: &ModelState) -> Result<bool> {
        let report = DiffReport::build(&self.model, updated)?;
        self.reporter.report(&report).await
    }
}

/// Terminal result of a job run
#[derive(Debug)]
pub enum JobOutcome {
    /// Artifacts downloaded, training may begin
    Ready(ReadyCycle),
    /// Coordinator asked the worker to come back later
    Rejected {
        /// Suggested wait before starting again
        timeout: Option<Duration>,
    },
    /// Negotiation halted
    Failed(Error),
}

/// Handle to a running negotiation
#[derive(Debug)]
pub struct JobRun {
    state: watch::Receiver<NegotiationState>,
    outcome: oneshot::Receiver<JobOutcome>,
}

impl JobRun {
    /// Current state
    pub fn state(&self) -> NegotiationState {
        self.state.borrow().clone()
    }

    /// Receiver notified on every transition
    pub fn watch_state(&self) -> watch::Receiver<NegotiationState> {
        self.state.clone()
    }

    /// Wait for the run to finish
    pub async fn outcome(self) -> JobOutcome {
        self.outcome.await.unwrap_or_else(|_| {
            JobOutcome::Failed(Error::network("negotiation task ended without an outcome"))
        })
    }

    /// Wait for the run and invoke exactly one of the handlers
    pub async fn dispatch<R, J, F>(self, on_ready: R, on_rejected: J, on_error: F)
    where
        R: FnOnce(ReadyCycle),
        J: FnOnce(Option<Duration>),
        F: FnOnce(Error),
    {
        match self.outcome().await {
            JobOutcome::Ready(cycle) => on_ready(cycle),
            JobOutcome::Rejected { timeout } => on_rejected(timeout),
            JobOutcome::Failed(err) => on_error(err),
        }
    }
}

/// Publishes forward-only state transitions
struct StateTracker {
    tx: watch::Sender<NegotiationState>,
    model_name: String,
}

impl StateTracker {
    fn advance(&self, next: NegotiationState) {
        self.tx.send_if_modified(|current| {
            if !current.can_advance_to(&next) {
                tracing::warn!(
                    model = %self.model_name,
                    from = current.name(),
                    to = next.name(),
                    "illegal transition ignored"
                );
                return false;
            }
            tracing::debug!(model = %self.model_name, from = current.name(), to = next.name(), "job state");
            *current = next;
            true
        });
    }

    fn fail(&self, err: &Error) {
        tracing::warn!(model = %self.model_name, error = %err, "job failed");
        self.advance(NegotiationState::Failed(err.kind()));
    }
}

/// One federated-learning job against one coordinator
pub struct Job {
    config: JobConfig,
    transport: Arc<dyn CoordinatorTransport>,
    speed_test: Arc<dyn SpeedTest>,
    fetcher: ArtifactFetcher,
    admission: AdmissionController,
    prober: ConnectionMetricsProber,
    codec: Arc<dyn ModelCodec>,
    current: CurrentRun,
}

impl core::fmt::Debug for Job {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Job")
            .field("config", &self.config)
            .field("transport", &self.transport.kind())
            .finish_non_exhaustive()
    }
}

impl Job {
    /// Start configuring a job
    pub fn builder(config: JobConfig) -> JobBuilder {
        JobBuilder {
            config,
            transport: None,
            artifacts: None,
            speed_test: None,
            device: Arc::new(StaticDevice::plugged_in()),
            host_probe: Arc::new(TcpHostProbe::default()),
            clock: Arc::new(SystemClock::new()),
            codec: Arc::new(PostcardCodec),
        }
    }

    /// The job's configuration
    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    /// Reporter for the job's latest run; a no-op until that run's cycle is
    /// accepted
    pub fn reporter(&self) -> DiffReporter {
        self.reporter_for(IdSource::Latest(self.current.clone()))
    }

    fn reporter_for(&self, ids: IdSource) -> DiffReporter {
        DiffReporter {
            transport: self.transport.clone(),
            codec: self.codec.clone(),
            ids,
        }
    }

    /// Begin a fresh negotiation.
    ///
    /// The charging check runs before this returns; when it fails the run is
    /// already `Failed` and nothing was sent. Must be called within a Tokio
    /// runtime.
    pub fn start(&self, require_charging: bool, require_wifi: bool) -> JobRun {
        let (state_tx, state) = watch::channel(NegotiationState::Idle);
        let (outcome_tx, outcome) = oneshot::channel();
        let tracker = StateTracker {
            tx: state_tx,
            model_name: self.config.model_name.clone(),
        };
        let ids = Arc::new(SessionIds::default());
        if let Ok(mut current) = self.current.lock() {
            *current = ids.clone();
        }

        tracing::info!(
            endpoint = %self.config.endpoint,
            model = %self.config.model_name,
            version = %self.config.version,
            "job starting"
        );
        tracker.advance(NegotiationState::CheckingEligibility);
        if let Err(err) = self.admission.check_charging(require_charging) {
            tracker.fail(&err);
            let _ = outcome_tx.send(JobOutcome::Failed(err));
            return JobRun { state, outcome };
        }

        let negotiation = Negotiation {
            config: self.config.clone(),
            transport: self.transport.clone(),
            speed_test: self.speed_test.clone(),
            fetcher: self.fetcher.clone(),
            admission: self.admission.clone(),
            prober: self.prober.clone(),
            reporter: self.reporter_for(IdSource::Run(ids.clone())),
            ids,
        };
        let transport = self.transport.clone();
        tokio::spawn(async move {
            let outcome = match negotiation.run(&tracker, require_wifi).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    tracker.fail(&err);
                    JobOutcome::Failed(err)
                }
            };
            // Reports reconnect on demand.
            transport.release().await;
            // The caller may have dropped the run handle.
            let _ = outcome_tx.send(outcome);
        });
        JobRun { state, outcome }
    }
}

/// Owned inputs of one negotiation task
struct Negotiation {
    config: JobConfig,
    transport: Arc<dyn CoordinatorTransport>,
    speed_test: Arc<dyn SpeedTest>,
    fetcher: ArtifactFetcher,
    admission: AdmissionController,
    prober: ConnectionMetricsProber,
    reporter: DiffReporter,
    ids: Arc<SessionIds>,
}

impl Negotiation {
    async fn run(self, tracker: &StateTracker, require_wifi: bool) -> Result<JobOutcome> {
        self.admission.check_network(require_wifi).await?;

        tracker.advance(NegotiationState::Authenticating);
        let reply = self
            .transport
            .authenticate(&AuthRequest {
                auth_token: self.config.auth_token.clone(),
                model_name: self.config.model_name.clone(),
                model_version: self.config.version.clone(),
            })
            .await?;
        let auth = match reply {
            AuthReply::Accepted(auth) => auth,
            AuthReply::Denied(body) => return Err(Error::Authentication(body.error)),
        };
        let worker_id = auth.worker_id;
        self.ids.set_worker_id(worker_id.clone());
        tracing::info!(worker_id = %worker_id, speed_test = auth.requires_speed_test, "authenticated");

        let metrics = if auth.requires_speed_test {
            tracker.advance(NegotiationState::ProbingMetrics);
            let metrics = self
                .prober
                .probe(
                    &self.config.endpoint,
                    &worker_id,
                    self.speed_test.as_ref(),
                    self.transport.round_trip_estimate(),
                )
                .await?;
            Some(metrics)
        } else {
            None
        };

        tracker.advance(NegotiationState::RequestingCycle);
        let response = self
            .transport
            .cycle_request(&CycleRequest {
                worker_id: worker_id.clone(),
                model: self.config.model_name.clone(),
                version: self.config.version.clone(),
                ping: metrics.map(|m| m.ping_millis),
                download: metrics.map(|m| m.download_mbps),
                upload: metrics.map(|m| m.upload_mbps),
            })
            .await?;

        let accepted = match response {
            CycleResponse::Accepted(accepted) => accepted,
            CycleResponse::Rejected(rejected) => {
                tracing::info!(
                    worker_id = %worker_id,
                    status = %rejected.status,
                    timeout = ?rejected.timeout,
                    error = ?rejected.error,
                    "cycle rejected"
                );
                return match rejected.retry_after() {
                    Some(timeout) => {
                        tracker.advance(NegotiationState::Rejected { timeout: Some(timeout) });
                        Ok(JobOutcome::Rejected { timeout: Some(timeout) })
                    }
                    None => Err(Error::CycleRejected {
                        status: rejected.status,
                        timeout: None,
                    }),
                };
            }
        };

        self.ids.set_request_key(accepted.request_key.clone());
        tracing::info!(
            worker_id = %worker_id,
            request_key = %accepted.request_key,
            plan = %accepted.training_plan,
            model = %accepted.model,
            "cycle accepted"
        );
        let bundle = self
            .fetcher
            .fetch(&worker_id, &accepted.request_key, &accepted.training_plan, &accepted.model)
            .await?;

        tracker.advance(NegotiationState::Ready {
            client_config: accepted.client_config.clone(),
            plan_id: accepted.training_plan.clone(),
            model_id: accepted.model.clone(),
            request_key: accepted.request_key.clone(),
        });
        Ok(JobOutcome::Ready(ReadyCycle {
            worker_id,
            request_key: accepted.request_key,
            plan: bundle.plan,
            model_id: accepted.model,
            model: bundle.model,
            model_sha256: bundle.model_sha256,
            client_config: accepted.client_config,
            reporter: self.reporter,
        }))
    }
}

/// Builder for [`Job`]
pub struct JobBuilder {
    config: JobConfig,
    transport: Option<Arc<dyn CoordinatorTransport>>,
    artifacts: Option<Arc<dyn ArtifactSource>>,
    speed_test: Option<Arc<dyn SpeedTest>>,
    device: Arc<dyn DeviceMonitor>,
    host_probe: Arc<dyn HostProbe>,
    clock: Arc<dyn Clock>,
    codec: Arc<dyn ModelCodec>,
}

impl JobBuilder {
    /// Use one object for session calls, downloads and speed tests
    pub fn coordinator<T>(self, coordinator: Arc<T>) -> Self
    where
        T: CoordinatorTransport + ArtifactSource + SpeedTest + 'static,
    {
        self.transport(coordinator.clone())
            .artifacts(coordinator.clone())
            .speed_test(coordinator)
    }

    /// Session transport
    pub fn transport(mut self, transport: Arc<dyn CoordinatorTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Plan and model source
    pub fn artifacts(mut self, artifacts: Arc<dyn ArtifactSource>) -> Self {
        self.artifacts = Some(artifacts);
        self
    }

    /// Bandwidth probes
    pub fn speed_test(mut self, speed_test: Arc<dyn SpeedTest>) -> Self {
        self.speed_test = Some(speed_test);
        self
    }

    /// Battery and interface status
    pub fn device(mut self, device: Arc<dyn DeviceMonitor>) -> Self {
        self.device = device;
        self
    }

    /// Ping probe used when the transport has no round-trip estimate
    pub fn host_probe(mut self, host_probe: Arc<dyn HostProbe>) -> Self {
        self.host_probe = host_probe;
        self
    }

    /// Clock timing the metrics probes
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Model container format
    pub fn codec(mut self, codec: Arc<dyn ModelCodec>) -> Self {
        self.codec = codec;
        self
    }

    /// Build the job; every transport seam must be set
    pub fn build(self) -> Result<Job> {
        let missing = |what: &str| Error::Config(format!("job for `{}` has no {what}", self.config.model_name));
        let transport = self.transport.clone().ok_or_else(|| missing("coordinator transport"))?;
        let artifacts = self.artifacts.clone().ok_or_else(|| missing("artifact source"))?;
        let speed_test = self.speed_test.clone().ok_or_else(|| missing("speed test"))?;
        Ok(Job {
            transport,
            speed_test,
            fetcher: ArtifactFetcher::new(artifacts, self.codec.clone()),
            admission: AdmissionController::new(self.device),
            prober: ConnectionMetricsProber::new(self.host_probe, self.clock),
            codec: self.codec,
            current: Arc::new(StdMutex::new(Arc::new(SessionIds::default()))),
            config: self.config,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fedlink_core::ErrorKind;
    use fedlink_net::protocol::{ArtifactKind, CycleRejected, ErrorBody};
    use fedlink_net::MockCoordinator;

    fn config() -> JobConfig {
        JobConfig::builder("http://localhost:5000", "mnist", "1.0.0").build().unwrap()
    }

    fn client_config() -> ClientConfig {
        serde_json::from_str(r#"{"name":"mnist","version":"1.0.0","batch_size":8,"lr":0.1}"#).unwrap()
    }

    #[tokio::test]
    async fn denied_authentication_fails_the_run() {
        let coordinator = MockCoordinator::new(
            AuthReply::Denied(ErrorBody {
                error: "invalid token".into(),
            }),
            CycleResponse::Rejected(CycleRejected {
                status: "rejected".into(),
                timeout: None,
                error: None,
            }),
        );
        let job = Job::builder(config())
            .coordinator(Arc::new(coordinator))
            .build()
            .unwrap();
        let run = job.start(false, false);
        let state = run.watch_state();
        match run.outcome().await {
            JobOutcome::Failed(Error::Authentication(cause)) => assert_eq!(cause, "invalid token"),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(*state.borrow(), NegotiationState::Failed(ErrorKind::Authentication));
    }

    #[tokio::test]
    async fn rejection_without_timeout_is_a_failure() {
        let coordinator = MockCoordinator::accepting("w", "k", client_config()).with_cycle(
            CycleResponse::Rejected(CycleRejected {
                status: "rejected".into(),
                timeout: None,
                error: Some("cycle full".into()),
            }),
        );
        let job = Job::builder(config())
            .coordinator(Arc::new(coordinator))
            .build()
            .unwrap();
        match job.start(false, false).outcome().await {
            JobOutcome::Failed(Error::CycleRejected { status, timeout }) => {
                assert_eq!(status, "rejected");
                assert_eq!(timeout, None);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn transport_failure_halts_without_retry() {
        let coordinator = Arc::new(
            MockCoordinator::accepting("w", "k", client_config())
                .with_artifact(ArtifactKind::Plan, "1", b"plan".to_vec())
                .failing_on("cycle_request"),
        );
        let job = Job::builder(config()).coordinator(coordinator.clone()).build().unwrap();
        let outcome = job.start(false, false).outcome().await;
        assert!(matches!(outcome, JobOutcome::Failed(Error::Network { .. })));
        assert_eq!(coordinator.calls(), vec!["authenticate", "cycle_request"]);
    }

    #[tokio::test]
    async fn builder_requires_transports() {
        let err = Job::builder(config()).build().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[tokio::test]
    async fn dispatch_invokes_exactly_one_handler() {
        let coordinator = MockCoordinator::accepting("w", "k", client_config()).with_cycle(
            CycleResponse::Rejected(CycleRejected {
                status: "rejected".into(),
                timeout: Some(30.0),
                error: None,
            }),
        );
        let job = Job::builder(config())
            .coordinator(Arc::new(coordinator))
            .build()
            .unwrap();
        let seen = std::cell::RefCell::new(Vec::new());
        job.start(false, false)
            .dispatch(
                |_| seen.borrow_mut().push("ready"),
                |timeout| {
                    assert_eq!(timeout, Some(Duration::from_secs(30)));
                    seen.borrow_mut().push("rejected")
                },
                |_| seen.borrow_mut().push("error"),
            )
            .await;
        assert_eq!(seen.into_inner(), vec!["rejected"]);
    }
}
