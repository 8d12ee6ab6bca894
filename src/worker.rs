//! The inpainting worker: a single tokio task owning the model session.
//!
//! The worker is driven entirely by messages. It downloads the model on the
//! first `ping`, creates the session, then serves `runRemove` requests one at
//! a time in arrival order. Blocking work runs on the blocking pool and every
//! suspension point is bounded by a timeout.

pub mod protocol;

pub use self::protocol::{
    ProtocolFaultError, RejectReason, WorkerCommand, WorkerPayload, WorkerRequest, WorkerResponse,
};

use crate::config::WorkerConfig;
use crate::data_loader::{BlobCache, ByteFetcher, DownloadProgress, ModelFetcher, ProgressObserver};
use crate::engine::{ExecutionTarget, InferenceEngine, IMAGE_INPUT, MASK_INPUT};
use crate::tensor::{NamedTensors, Tensor};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, instrument, warn};

/// Minimum number of bytes between two `downloadProgress` payloads.
const PROGRESS_STEP: u64 = 1 << 20;

/// Lifecycle of a worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum WorkerState {
    Uninitialized,
    Downloading,
    LoadingSession,
    Ready,
    Busy,
    Error,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerState::Uninitialized => "uninitialized",
            WorkerState::Downloading => "downloading",
            WorkerState::LoadingSession => "loadingSession",
            WorkerState::Ready => "ready",
            WorkerState::Busy => "busy",
            WorkerState::Error => "error",
        };
        f.write_str(name)
    }
}

/// What the worker reads from its inbox.
#[derive(Debug)]
pub enum WorkerFrame {
    /// Already decoded request; tensors are moved, not serialised.
    Request(WorkerRequest),
    /// JSON text that still has to be decoded.
    Raw(String),
}

impl From<WorkerRequest> for WorkerFrame {
    fn from(request: WorkerRequest) -> Self {
        WorkerFrame::Request(request)
    }
}

/// Channels connecting a spawned worker to its caller.
pub struct WorkerHandle {
    pub requests: mpsc::UnboundedSender<WorkerFrame>,
    pub responses: mpsc::UnboundedReceiver<WorkerResponse>,
    pub task: JoinHandle<()>,
}

/// Spawn a worker task. The task ends once every request sender is dropped.
pub fn spawn_worker<C, F>(
    config: WorkerConfig,
    cache: Arc<C>,
    fetcher: F,
    engine: Arc<InferenceEngine>,
) -> WorkerHandle
where
    C: BlobCache + 'static,
    F: ByteFetcher + 'static,
{
    let (request_tx, request_rx) = mpsc::unbounded_channel();
    let (response_tx, response_rx) = mpsc::unbounded_channel();

    let worker = InpaintWorker::new(config, cache, fetcher, engine, response_tx);
    let task = tokio::spawn(worker.run(request_rx));

    WorkerHandle {
        requests: request_tx,
        responses: response_rx,
        task,
    }
}

pub struct InpaintWorker<C, F> {
    config: WorkerConfig,
    fetcher: ModelFetcher<C, F>,
    engine: Arc<InferenceEngine>,
    state: WorkerState,
    device: Option<ExecutionTarget>,
    responses: mpsc::UnboundedSender<WorkerResponse>,
}

impl<C, F> InpaintWorker<C, F>
where
    C: BlobCache + 'static,
    F: ByteFetcher + 'static,
{
    pub fn new(
        config: WorkerConfig,
        cache: Arc<C>,
        fetcher: F,
        engine: Arc<InferenceEngine>,
        responses: mpsc::UnboundedSender<WorkerResponse>,
    ) -> Self {
        let mut fetcher = ModelFetcher::new(cache, fetcher, config.retry.clone());
        if let Some(digest) = &config.model_sha256 {
            fetcher = fetcher.with_expected_sha256(digest.clone());
        }

        InpaintWorker {
            config,
            fetcher,
            engine,
            state: WorkerState::Uninitialized,
            device: None,
            responses,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn device(&self) -> Option<ExecutionTarget> {
        self.device
    }

    /// Handle frames until the inbox closes.
    pub async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<WorkerFrame>) {
        info!("worker started for '{}'", self.config.model_url);

        while let Some(frame) = inbox.recv().await {
            self.handle_frame(frame).await;
        }

        debug!("worker inbox closed in state '{}'", self.state);
    }

    pub async fn handle_frame(&mut self, frame: WorkerFrame) {
        match frame {
            WorkerFrame::Request(request) => self.handle_request(request).await,
            WorkerFrame::Raw(text) => match WorkerRequest::from_json(&text) {
                Ok(request) => self.handle_request(request).await,
                Err(fault) => {
                    warn!("{}", fault);
                    self.reject(fault.id, RejectReason::ProtocolFault, fault.message);
                }
            },
        }
    }

    #[instrument(level = "debug", skip_all, fields(id = request.id, command = request.command.name()))]
    async fn handle_request(&mut self, request: WorkerRequest) {
        let WorkerRequest { id, command } = request;

        match command {
            WorkerCommand::Ping => {
                if self.state != WorkerState::Uninitialized {
                    let message = format!("worker already initialised, state '{}'", self.state);
                    self.reject(id, RejectReason::AlreadyInitialized, message);
                    return;
                }
                self.initialize(id).await;
            }
            WorkerCommand::RunRemove {
                img_array,
                img_array_shape,
                mask_array,
                mask_array_shape,
            } => {
                if self.state != WorkerState::Ready {
                    let message = format!("worker is not ready, state '{}'", self.state);
                    self.reject(id, RejectReason::NotReady, message);
                    return;
                }

                match remove_inputs(img_array, img_array_shape, mask_array, mask_array_shape) {
                    Ok(inputs) => self.run_remove(id, inputs).await,
                    Err(message) => {
                        warn!("runRemove {} refused: {}", id, message);
                        self.send(id, WorkerPayload::RemoveFailed { message });
                    }
                }
            }
        }
    }

    async fn initialize(&mut self, id: u64) {
        self.state = WorkerState::Downloading;
        self.send(id, WorkerPayload::DownloadInProgress);

        let reporter = progress_reporter(id, self.responses.clone());
        let silent = |_: DownloadProgress| {};
        let observer: ProgressObserver<'_> = if self.config.download_progress {
            &reporter
        } else {
            &silent
        };
        let url = self.config.model_url.clone();

        let artifact = match timeout(
            self.config.timeouts.download,
            self.fetcher.load_with_progress(&url, observer),
        )
        .await
        {
            Ok(Ok(artifact)) => artifact,
            Ok(Err(e)) => return self.fail_initialization(id, e.to_string()),
            Err(_) => {
                let reason = format!("download timed out after {:?}", self.config.timeouts.download);
                return self.fail_initialization(id, reason);
            }
        };

        info!("model '{}' available ({} bytes)", artifact.url, artifact.len());

        self.state = WorkerState::LoadingSession;
        self.send(id, WorkerPayload::LoadingInProgress);

        let engine = self.engine.clone();
        let targets = self.config.targets.clone();
        let bytes = artifact.bytes;
        let creation = tokio::task::spawn_blocking(move || engine.create_session(&bytes, &targets));

        match timeout(self.config.timeouts.session, creation).await {
            Ok(Ok(Ok((_session, target)))) => {
                info!("session ready on '{}'", target);
                self.state = WorkerState::Ready;
                self.device = Some(target);
                self.send(
                    id,
                    WorkerPayload::Pong {
                        success: true,
                        device: Some(target.to_string()),
                    },
                );
            }
            Ok(Ok(Err(e))) => self.fail_initialization(id, e.to_string()),
            Ok(Err(join)) => self.fail_initialization(id, format!("session task failed: {}", join)),
            Err(_) => {
                let reason = format!(
                    "session creation timed out after {:?}",
                    self.config.timeouts.session
                );
                self.fail_initialization(id, reason);
            }
        }
    }

    fn fail_initialization(&mut self, id: u64, reason: String) {
        error!("initialisation failed in state '{}': {}", self.state, reason);
        self.state = WorkerState::Error;
        self.send(
            id,
            WorkerPayload::Pong {
                success: false,
                device: None,
            },
        );
    }

    async fn run_remove(&mut self, id: u64, inputs: NamedTensors) {
        self.state = WorkerState::Busy;

        let engine = self.engine.clone();
        let preferred = engine
            .session()
            .map(|session| session.output_names().to_vec())
            .unwrap_or_default();
        let inference = tokio::task::spawn_blocking(move || engine.infer(inputs));

        let payload = match timeout(self.config.timeouts.infer, inference).await {
            Ok(Ok(Ok(outputs))) => {
                self.state = WorkerState::Ready;
                match first_output(outputs, &preferred) {
                    Some(tensor) => {
                        debug!("runRemove {} produced {:?}", id, tensor.shape());
                        WorkerPayload::RemoveDone(tensor)
                    }
                    None => WorkerPayload::RemoveFailed {
                        message: "model produced no outputs".to_string(),
                    },
                }
            }
            Ok(Ok(Err(e))) => {
                error!("runRemove {} failed: {}", id, e);
                self.state = WorkerState::Ready;
                WorkerPayload::RemoveFailed {
                    message: e.to_string(),
                }
            }
            Ok(Err(join)) => {
                error!("runRemove {} panicked: {}", id, join);
                self.state = WorkerState::Ready;
                WorkerPayload::RemoveFailed {
                    message: format!("inference task failed: {}", join),
                }
            }
            Err(_) => {
                // the blocking call cannot be cancelled and still holds the session
                error!("runRemove {} timed out after {:?}", id, self.config.timeouts.infer);
                self.state = WorkerState::Error;
                WorkerPayload::RemoveFailed {
                    message: format!("inference timed out after {:?}", self.config.timeouts.infer),
                }
            }
        };

        self.send(id, payload);
    }

    fn reject(&self, id: u64, reason: RejectReason, message: String) {
        debug!("rejecting request {}: {}", id, message);
        self.send(id, WorkerPayload::Rejected { reason, message });
    }

    fn send(&self, id: u64, payload: WorkerPayload) {
        if self.responses.send(WorkerResponse { id, payload }).is_err() {
            debug!("response receiver dropped, discarding reply to {}", id);
        }
    }
}

/// Validate a `runRemove` body and turn it into the engine's named inputs.
fn remove_inputs(
    img_array: Vec<f32>,
    img_array_shape: Vec<usize>,
    mask_array: Vec<f32>,
    mask_array_shape: Vec<usize>,
) -> Result<NamedTensors, String> {
    let image = Tensor::new(img_array_shape, img_array).map_err(|e| format!("image: {}", e))?;
    let mask = Tensor::new(mask_array_shape, mask_array).map_err(|e| format!("mask: {}", e))?;

    match (image.shape(), mask.shape()) {
        ([1, 3, ih, iw], [1, 1, mh, mw]) if ih == mh && iw == mw && *ih > 0 && *iw > 0 => {}
        (image_shape, mask_shape) => {
            return Err(format!(
                "expected image [1, 3, H, W] and mask [1, 1, H, W], got {:?} and {:?}",
                image_shape, mask_shape
            ))
        }
    }

    Ok(NamedTensors::from([
        (IMAGE_INPUT.to_string(), image),
        (MASK_INPUT.to_string(), mask),
    ]))
}

fn first_output(mut outputs: NamedTensors, preferred: &[String]) -> Option<Tensor> {
    for name in preferred {
        if let Some(tensor) = outputs.remove(name) {
            return Some(tensor);
        }
    }
    outputs.into_values().next()
}

/// Forwards download progress as non-terminal payloads, at most one per
/// `PROGRESS_STEP` bytes plus the final one.
fn progress_reporter(
    id: u64,
    responses: mpsc::UnboundedSender<WorkerResponse>,
) -> impl Fn(DownloadProgress) + Send + Sync {
    let last = AtomicU64::new(0);

    move |progress: DownloadProgress| {
        let previous = last.load(Ordering::Relaxed);
        let finished = progress.total == Some(progress.received);

        if progress.received.saturating_sub(previous) < PROGRESS_STEP && !finished {
            return;
        }
        last.store(progress.received, Ordering::Relaxed);

        let _ = responses.send(WorkerResponse {
            id,
            payload: WorkerPayload::DownloadProgress {
                received: progress.received,
                total: progress.total,
            },
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RetryConfig, TimeoutConfig};
    use crate::data_loader::{DownloadError, MemoryBlobCache, ScriptedFetcher};
    use crate::engine::tests::{EchoSession, FakeBackend};
    use crate::engine::{InferenceBackend, InferenceResult, InferenceSession};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::time::Duration;

    const SIZE: usize = 512;

    fn config() -> WorkerConfig {
        WorkerConfig {
            model_url: "https://models.example/lama_fp32.onnx".into(),
            cache_dir: None,
            targets: vec![ExecutionTarget::Gpu, ExecutionTarget::Cpu],
            timeouts: TimeoutConfig {
                download: Duration::from_secs(5),
                session: Duration::from_secs(5),
                infer: Duration::from_secs(5),
                connect: Duration::from_secs(1),
            },
            retry: RetryConfig {
                max_retries: 0,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn spawn_with<F: ByteFetcher + 'static>(
        config: WorkerConfig,
        fetcher: F,
        backend: Box<dyn InferenceBackend>,
    ) -> WorkerHandle {
        spawn_worker(
            config,
            Arc::new(MemoryBlobCache::new()),
            fetcher,
            Arc::new(InferenceEngine::new(backend)),
        )
    }

    fn spawn_default() -> WorkerHandle {
        spawn_with(
            config(),
            ScriptedFetcher::serving(b"lama weights"),
            Box::new(FakeBackend::working_on(&[ExecutionTarget::Cpu])),
        )
    }

    fn send(handle: &WorkerHandle, id: u64, command: WorkerCommand) {
        handle
            .requests
            .send(WorkerRequest::new(id, command).into())
            .unwrap();
    }

    /// Payloads of `id` up to and including its terminal one.
    async fn collect(handle: &mut WorkerHandle, id: u64) -> Vec<WorkerPayload> {
        let mut payloads = Vec::new();
        loop {
            let response = tokio::time::timeout(Duration::from_secs(10), handle.responses.recv())
                .await
                .expect("worker stalled")
                .expect("worker gone");
            assert_eq!(response.id, id, "response for an unexpected request");

            let terminal = response.payload.is_terminal();
            payloads.push(response.payload);
            if terminal {
                return payloads;
            }
        }
    }

    fn remove_command(size: usize) -> WorkerCommand {
        WorkerCommand::run_remove(
            Tensor::new(vec![1, 3, size, size], vec![0.5; 3 * size * size]).unwrap(),
            Tensor::zeros(vec![1, 1, size, size]),
        )
    }

    async fn initialised() -> WorkerHandle {
        let mut handle = spawn_default();
        send(&handle, 1, WorkerCommand::Ping);
        collect(&mut handle, 1).await;
        handle
    }

    #[tokio::test]
    async fn ping_then_remove_follows_the_protocol() {
        let mut handle = spawn_default();

        send(&handle, 1, WorkerCommand::Ping);
        assert_eq!(
            collect(&mut handle, 1).await,
            vec![
                WorkerPayload::DownloadInProgress,
                WorkerPayload::LoadingInProgress,
                WorkerPayload::Pong {
                    success: true,
                    device: Some("cpu".into())
                },
            ]
        );

        send(&handle, 2, remove_command(SIZE));
        let payloads = collect(&mut handle, 2).await;
        assert_eq!(payloads.len(), 1);
        match &payloads[0] {
            WorkerPayload::RemoveDone(tensor) => assert_eq!(tensor.shape(), &[1, 3, SIZE, SIZE]),
            other => panic!("expected removeDone, got {}", other.name()),
        }

        // the next response belongs to the next request
        send(&handle, 3, WorkerCommand::Ping);
        assert!(matches!(
            collect(&mut handle, 3).await.as_slice(),
            [WorkerPayload::Rejected {
                reason: RejectReason::AlreadyInitialized,
                ..
            }]
        ));
    }

    #[tokio::test]
    async fn download_progress_is_forwarded_when_enabled() {
        let mut config = config();
        config.download_progress = true;
        let mut handle = spawn_with(
            config,
            ScriptedFetcher::serving(b"lama weights"),
            Box::new(FakeBackend::working_on(&[ExecutionTarget::Cpu])),
        );
        send(&handle, 1, WorkerCommand::Ping);

        assert_eq!(
            collect(&mut handle, 1).await,
            vec![
                WorkerPayload::DownloadInProgress,
                WorkerPayload::DownloadProgress {
                    received: 12,
                    total: Some(12)
                },
                WorkerPayload::LoadingInProgress,
                WorkerPayload::Pong {
                    success: true,
                    device: Some("cpu".into())
                },
            ]
        );
    }

    #[tokio::test]
    async fn remove_before_ping_is_rejected() {
        let mut handle = spawn_default();

        send(&handle, 5, remove_command(4));
        assert!(matches!(
            collect(&mut handle, 5).await.as_slice(),
            [WorkerPayload::Rejected {
                reason: RejectReason::NotReady,
                ..
            }]
        ));
    }

    #[tokio::test]
    async fn failed_download_reports_unsuccessful_pong() {
        let mut handle = spawn_with(
            config(),
            ScriptedFetcher::failing(),
            Box::new(FakeBackend::working_on(&[ExecutionTarget::Cpu])),
        );

        send(&handle, 1, WorkerCommand::Ping);
        assert_eq!(
            collect(&mut handle, 1).await,
            vec![
                WorkerPayload::DownloadInProgress,
                WorkerPayload::Pong {
                    success: false,
                    device: None
                },
            ]
        );

        send(&handle, 2, remove_command(4));
        assert!(matches!(
            collect(&mut handle, 2).await.as_slice(),
            [WorkerPayload::Rejected {
                reason: RejectReason::NotReady,
                ..
            }]
        ));

        send(&handle, 3, WorkerCommand::Ping);
        assert!(matches!(
            collect(&mut handle, 3).await.as_slice(),
            [WorkerPayload::Rejected {
                reason: RejectReason::AlreadyInitialized,
                ..
            }]
        ));
    }

    #[tokio::test]
    async fn no_working_target_reports_unsuccessful_pong() {
        let mut handle = spawn_with(
            config(),
            ScriptedFetcher::serving(b"lama weights"),
            Box::new(FakeBackend::working_on(&[])),
        );

        send(&handle, 1, WorkerCommand::Ping);
        assert_eq!(
            collect(&mut handle, 1).await,
            vec![
                WorkerPayload::DownloadInProgress,
                WorkerPayload::LoadingInProgress,
                WorkerPayload::Pong {
                    success: false,
                    device: None
                },
            ]
        );
    }

    /// Never finishes a download.
    struct StalledFetcher;

    #[async_trait]
    impl ByteFetcher for StalledFetcher {
        async fn fetch(&self, _url: &str, _progress: ProgressObserver<'_>) -> Result<Bytes, DownloadError> {
            std::future::pending().await
        }
    }

    async fn assert_not_ready(handle: &mut WorkerHandle, id: u64) {
        send(handle, id, remove_command(4));
        assert!(matches!(
            collect(handle, id).await.as_slice(),
            [WorkerPayload::Rejected {
                reason: RejectReason::NotReady,
                ..
            }]
        ));
    }

    #[tokio::test]
    async fn download_timeout_reports_unsuccessful_pong() {
        let mut config = config();
        config.timeouts.download = Duration::from_millis(20);

        let mut handle = spawn_with(
            config,
            StalledFetcher,
            Box::new(FakeBackend::working_on(&[ExecutionTarget::Cpu])),
        );

        send(&handle, 1, WorkerCommand::Ping);
        assert_eq!(
            collect(&mut handle, 1).await,
            vec![
                WorkerPayload::DownloadInProgress,
                WorkerPayload::Pong {
                    success: false,
                    device: None
                },
            ]
        );
        assert_not_ready(&mut handle, 2).await;
    }

    /// Takes longer to build a session than the worker waits for.
    struct SlowLoadingBackend;

    impl InferenceBackend for SlowLoadingBackend {
        fn name(&self) -> &'static str {
            "slow-loading"
        }

        fn create_session(
            &self,
            _model: &[u8],
            target: ExecutionTarget,
        ) -> InferenceResult<Arc<dyn InferenceSession>> {
            std::thread::sleep(Duration::from_millis(300));
            Ok(Arc::new(EchoSession::new(target)))
        }
    }

    #[tokio::test]
    async fn session_timeout_reports_unsuccessful_pong() {
        let mut config = config();
        config.targets = vec![ExecutionTarget::Cpu];
        config.timeouts.session = Duration::from_millis(20);

        let mut handle = spawn_with(
            config,
            ScriptedFetcher::serving(b"lama weights"),
            Box::new(SlowLoadingBackend),
        );

        send(&handle, 1, WorkerCommand::Ping);
        assert_eq!(
            collect(&mut handle, 1).await,
            vec![
                WorkerPayload::DownloadInProgress,
                WorkerPayload::LoadingInProgress,
                WorkerPayload::Pong {
                    success: false,
                    device: None
                },
            ]
        );
        assert_not_ready(&mut handle, 2).await;
    }

    #[tokio::test]
    async fn bad_shapes_fail_without_leaving_ready() {
        let mut handle = initialised().await;

        send(
            &handle,
            2,
            WorkerCommand::RunRemove {
                img_array: vec![0.0; 3],
                img_array_shape: vec![1, 3, 4, 4],
                mask_array: vec![0.0; 16],
                mask_array_shape: vec![1, 1, 4, 4],
            },
        );
        assert!(matches!(
            collect(&mut handle, 2).await.as_slice(),
            [WorkerPayload::RemoveFailed { .. }]
        ));

        send(
            &handle,
            3,
            WorkerCommand::run_remove(Tensor::zeros(vec![1, 3, 4, 4]), Tensor::zeros(vec![1, 1, 8, 8])),
        );
        assert!(matches!(
            collect(&mut handle, 3).await.as_slice(),
            [WorkerPayload::RemoveFailed { .. }]
        ));

        send(&handle, 4, remove_command(4));
        assert!(matches!(
            collect(&mut handle, 4).await.as_slice(),
            [WorkerPayload::RemoveDone(_)]
        ));
    }

    #[tokio::test]
    async fn undecodable_frames_are_protocol_faults() {
        let mut handle = initialised().await;

        handle
            .requests
            .send(WorkerFrame::Raw(r#"{"id":7,"command":{"type":"explode"}}"#.into()))
            .unwrap();
        assert!(matches!(
            collect(&mut handle, 7).await.as_slice(),
            [WorkerPayload::Rejected {
                reason: RejectReason::ProtocolFault,
                ..
            }]
        ));

        handle.requests.send(WorkerFrame::Raw("garbage".into())).unwrap();
        assert!(matches!(
            collect(&mut handle, 0).await.as_slice(),
            [WorkerPayload::Rejected {
                reason: RejectReason::ProtocolFault,
                ..
            }]
        ));

        // raw frames that do decode are served normally
        handle
            .requests
            .send(WorkerFrame::Raw(r#"{"id":8,"command":{"type":"ping"}}"#.into()))
            .unwrap();
        assert!(matches!(
            collect(&mut handle, 8).await.as_slice(),
            [WorkerPayload::Rejected {
                reason: RejectReason::AlreadyInitialized,
                ..
            }]
        ));
    }

    #[tokio::test]
    async fn worker_stops_when_requests_close() {
        let WorkerHandle {
            requests,
            mut responses,
            task,
        } = spawn_default();

        drop(requests);
        task.await.unwrap();
        assert!(responses.recv().await.is_none());
    }

    struct SlowSession;

    impl InferenceSession for SlowSession {
        fn target(&self) -> ExecutionTarget {
            ExecutionTarget::Cpu
        }

        fn input_names(&self) -> &[String] {
            &[]
        }

        fn output_names(&self) -> &[String] {
            &[]
        }

        fn infer(&self, _inputs: NamedTensors) -> InferenceResult<NamedTensors> {
            std::thread::sleep(Duration::from_millis(300));
            Ok(NamedTensors::new())
        }
    }

    struct SlowBackend;

    impl InferenceBackend for SlowBackend {
        fn name(&self) -> &'static str {
            "slow"
        }

        fn create_session(
            &self,
            _model: &[u8],
            _target: ExecutionTarget,
        ) -> InferenceResult<Arc<dyn InferenceSession>> {
            Ok(Arc::new(SlowSession))
        }
    }

    #[tokio::test]
    async fn inference_timeout_moves_worker_to_error() {
        let mut config = config();
        config.timeouts.infer = Duration::from_millis(20);

        let mut handle = spawn_with(config, ScriptedFetcher::serving(b"lama weights"), Box::new(SlowBackend));

        send(&handle, 1, WorkerCommand::Ping);
        collect(&mut handle, 1).await;

        send(&handle, 2, remove_command(4));
        assert!(matches!(
            collect(&mut handle, 2).await.as_slice(),
            [WorkerPayload::RemoveFailed { .. }]
        ));

        send(&handle, 3, remove_command(4));
        assert!(matches!(
            collect(&mut handle, 3).await.as_slice(),
            [WorkerPayload::Rejected {
                reason: RejectReason::NotReady,
                ..
            }]
        ));
    }

    #[test]
    fn declared_output_name_is_preferred() {
        let outputs = NamedTensors::from([
            ("1042".to_string(), Tensor::zeros(vec![1, 1, 1, 1])),
            ("output".to_string(), Tensor::zeros(vec![1, 3, 1, 1])),
        ]);

        let chosen = first_output(outputs, &["output".to_string()]).unwrap();
        assert_eq!(chosen.shape(), &[1, 3, 1, 1]);
    }

    #[test]
    fn progress_is_throttled() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let report = progress_reporter(1, tx);

        for received in [10, 20, PROGRESS_STEP + 5, PROGRESS_STEP + 10, 3 * PROGRESS_STEP] {
            report(DownloadProgress {
                received,
                total: Some(3 * PROGRESS_STEP),
            });
        }

        let mut seen = Vec::new();
        while let Ok(response) = rx.try_recv() {
            if let WorkerPayload::DownloadProgress { received, .. } = response.payload {
                seen.push(received);
            }
        }
        assert_eq!(seen, vec![PROGRESS_STEP + 5, 3 * PROGRESS_STEP]);
    }
}
