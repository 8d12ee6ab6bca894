//! Caller-side handle to an inpainting worker.
//!
//! Holds the current image and mask, encodes them for the worker, correlates
//! responses by request id and swaps the inpainted result in. At most one
//! request is outstanding at a time; `is_loading` reflects that.

use crate::codec::{CodecError, Size, TensorCodec};
use crate::config::WorkerConfig;
use crate::worker::{
    RejectReason, WorkerCommand, WorkerFrame, WorkerHandle, WorkerPayload, WorkerRequest,
    WorkerResponse,
};
use image::{imageops, GrayImage, Luma, RgbImage};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex as TokioMutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Slack added on top of the worker's own timeouts before giving up on it.
const RESPONSE_GRACE: Duration = Duration::from_secs(5);

/// Mask value marking a pixel for removal.
const MASKED: Luma<u8> = Luma([255]);

/// Observer of non-terminal payloads while a request is in flight.
pub type PayloadObserver<'a> = &'a (dyn Fn(&WorkerPayload) + Send + Sync);

/// Requests awaiting their terminal payload.
#[derive(Default)]
struct Pending {
    closed: bool,
    waiters: HashMap<u64, mpsc::UnboundedSender<WorkerPayload>>,
}

#[derive(Default)]
struct Surfaces {
    image: Option<RgbImage>,
    mask: Option<GrayImage>,
    /// Dimensions of the image as uploaded, before padding.
    source: Option<Size>,
    /// Bumped on every `set_image` so a late result never overwrites a newer
    /// upload.
    generation: u64,
}

pub struct Orchestrator {
    requests: mpsc::UnboundedSender<WorkerFrame>,
    pending: Arc<TokioMutex<Pending>>,
    next_id: AtomicU64,
    loading: AtomicBool,
    device: Mutex<Option<String>>,
    surfaces: Mutex<Surfaces>,
    codec: TensorCodec,
    image_size: u32,
    init_timeout: Duration,
    remove_timeout: Duration,
    worker: JoinHandle<()>,
}

/// Clears the loading flag when the request ends, however it ends.
struct LoadingGuard<'a>(&'a AtomicBool);

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Orchestrator {
    /// Take over a spawned worker and start correlating its responses.
    pub fn new(handle: WorkerHandle, config: &WorkerConfig) -> Self {
        let WorkerHandle {
            requests,
            responses,
            task,
        } = handle;

        let pending = Arc::new(TokioMutex::new(Pending::default()));
        tokio::spawn(response_reader_task(responses, pending.clone()));

        Orchestrator {
            requests,
            pending,
            next_id: AtomicU64::new(1),
            loading: AtomicBool::new(false),
            device: Mutex::new(None),
            surfaces: Mutex::new(Surfaces::default()),
            codec: TensorCodec::lama(),
            image_size: config.image_size,
            init_timeout: config
                .timeouts
                .download
                .saturating_add(config.timeouts.session)
                .saturating_add(RESPONSE_GRACE),
            remove_timeout: config.timeouts.infer.saturating_add(RESPONSE_GRACE),
            worker: task,
        }
    }

    pub fn with_codec(mut self, codec: TensorCodec) -> Self {
        self.codec = codec;
        self
    }

    pub fn is_loading(&self) -> bool {
        self.loading.load(Ordering::Acquire)
    }

    /// Execution target reported by the worker, once initialised.
    pub fn device(&self) -> Option<String> {
        lock(&self.device).clone()
    }

    pub fn image(&self) -> Option<RgbImage> {
        lock(&self.surfaces).image.clone()
    }

    pub fn mask(&self) -> Option<GrayImage> {
        lock(&self.surfaces).mask.clone()
    }

    pub fn source_size(&self) -> Option<Size> {
        lock(&self.surfaces).source
    }

    pub async fn init(&self) -> Result<String, OrchestratorError> {
        self.init_with_progress(&|_| {}).await
    }

    /// Ask the worker to download the model and build its session. Returns
    /// the execution target the session runs on.
    pub async fn init_with_progress(
        &self,
        progress: PayloadObserver<'_>,
    ) -> Result<String, OrchestratorError> {
        let _guard = self.begin()?;

        let payload = self
            .request(WorkerCommand::Ping, self.init_timeout, progress)
            .await?;

        match payload {
            WorkerPayload::Pong {
                success: true,
                device: Some(device),
            } => {
                info!("worker ready on '{}'", device);
                *lock(&self.device) = Some(device.clone());
                Ok(device)
            }
            WorkerPayload::Pong { .. } => Err(OrchestratorError::InitFailed),
            other => Err(unexpected(other)),
        }
    }

    /// Replace the current image. It is letterboxed into a square of its
    /// longer side and the mask is reset.
    pub fn set_image(&self, image: RgbImage) -> Result<(), OrchestratorError> {
        let source = Size::of_rgb(&image);
        let square = self.codec.pad_to_square(&image)?;

        let mut surfaces = lock(&self.surfaces);
        surfaces.mask = Some(GrayImage::new(square.width(), square.height()));
        surfaces.image = Some(square);
        surfaces.source = Some(source);
        surfaces.generation += 1;
        Ok(())
    }

    /// Replace the mask. Accepts either the padded image's dimensions or the
    /// dimensions of the image as uploaded, in which case it is padded the
    /// same way.
    pub fn set_mask(&self, mask: GrayImage) -> Result<(), OrchestratorError> {
        let mut surfaces = lock(&self.surfaces);
        let (image, source) = match (&surfaces.image, surfaces.source) {
            (Some(image), Some(source)) => (Size::of_rgb(image), source),
            _ => return Err(OrchestratorError::NoImage),
        };

        let actual = Size::of_gray(&mask);
        let mask = if actual == image {
            mask
        } else if actual == source {
            let placed = crate::codec::resize_and_pad_box(source, image)?;
            let mut canvas = GrayImage::new(image.w, image.h);
            imageops::overlay(&mut canvas, &mask, placed.x as i64, placed.y as i64);
            canvas
        } else {
            return Err(OrchestratorError::MaskSize {
                expected: image,
                actual,
            });
        };

        surfaces.mask = Some(mask);
        Ok(())
    }

    /// Paint a filled circle onto the mask. Parts outside the image are
    /// clipped.
    pub fn paint_mask(&self, cx: u32, cy: u32, radius: u32) -> Result<(), OrchestratorError> {
        let mut surfaces = lock(&self.surfaces);
        let mask = surfaces.mask.as_mut().ok_or(OrchestratorError::NoImage)?;

        let (w, h) = mask.dimensions();
        let r2 = (radius as u64) * (radius as u64);

        for y in cy.saturating_sub(radius)..=cy.saturating_add(radius).min(h.saturating_sub(1)) {
            for x in cx.saturating_sub(radius)..=cx.saturating_add(radius).min(w.saturating_sub(1)) {
                let (dx, dy) = (x.abs_diff(cx) as u64, y.abs_diff(cy) as u64);
                if dx * dx + dy * dy <= r2 {
                    mask.put_pixel(x, y, MASKED);
                }
            }
        }
        Ok(())
    }

    pub fn clear_mask(&self) {
        let mut surfaces = lock(&self.surfaces);
        if let Some(mask) = surfaces.mask.as_mut() {
            mask.fill(0);
        }
    }

    /// The current image cropped back to the dimensions it was uploaded with.
    pub fn unpadded_image(&self) -> Result<RgbImage, OrchestratorError> {
        let surfaces = lock(&self.surfaces);
        match (&surfaces.image, surfaces.source) {
            (Some(image), Some(source)) => Ok(self.codec.unletterbox(image, source)?),
            _ => Err(OrchestratorError::NoImage),
        }
    }

    /// Inpaint the masked region of the current image.
    ///
    /// On success the result replaces the current image, the mask is cleared
    /// and a copy of the result is returned. Fails with `Busy` while another
    /// request is outstanding.
    pub async fn remove(&self) -> Result<RgbImage, OrchestratorError> {
        let _guard = self.begin()?;

        if lock(&self.device).is_none() {
            return Err(OrchestratorError::NotReady);
        }

        let (image, mask, generation) = {
            let surfaces = lock(&self.surfaces);
            match (&surfaces.image, &surfaces.mask) {
                (Some(image), Some(mask)) => (image.clone(), mask.clone(), surfaces.generation),
                _ => return Err(OrchestratorError::NoImage),
            }
        };

        let target = Size::square(self.image_size);
        let command = WorkerCommand::run_remove(
            self.codec.image_to_tensor(&image, target)?,
            self.codec.mask_to_tensor(&mask, target)?,
        );

        let payload = self.request(command, self.remove_timeout, &|_| {}).await?;

        let tensor = match payload {
            WorkerPayload::RemoveDone(tensor) => tensor,
            WorkerPayload::RemoveFailed { message } => {
                return Err(OrchestratorError::RemoveFailed(message))
            }
            other => return Err(unexpected(other)),
        };

        let output = self.codec.tensor_to_image(&tensor)?;
        let result = self.codec.unletterbox(&output, Size::of_rgb(&image))?;

        let mut surfaces = lock(&self.surfaces);
        if surfaces.generation == generation {
            surfaces.image = Some(result.clone());
            if let Some(mask) = surfaces.mask.as_mut() {
                mask.fill(0);
            }
        } else {
            warn!("image replaced while removal was running, result not applied");
        }

        Ok(result)
    }

    /// Close the request channel and wait for the worker to finish.
    pub async fn shutdown(self) {
        drop(self.requests);
        if let Err(e) = self.worker.await {
            warn!("worker task ended abnormally: {}", e);
        }
    }

    fn begin(&self) -> Result<LoadingGuard<'_>, OrchestratorError> {
        self.loading
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| OrchestratorError::Busy)?;
        Ok(LoadingGuard(&self.loading))
    }

    /// Send a command and wait for its terminal payload.
    async fn request(
        &self,
        command: WorkerCommand,
        limit: Duration,
        progress: PayloadObserver<'_>,
    ) -> Result<WorkerPayload, OrchestratorError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let name = command.name();
        let (tx, mut rx) = mpsc::unbounded_channel();

        {
            let mut pending = self.pending.lock().await;
            if pending.closed {
                return Err(OrchestratorError::WorkerGone);
            }
            pending.waiters.insert(id, tx);
        }

        debug!("sending {} as request {}", name, id);
        if self.requests.send(WorkerRequest::new(id, command).into()).is_err() {
            self.pending.lock().await.waiters.remove(&id);
            return Err(OrchestratorError::WorkerGone);
        }

        let wait = async {
            while let Some(payload) = rx.recv().await {
                if payload.is_terminal() {
                    return Ok(payload);
                }
                debug!("request {} progress: {}", id, payload.name());
                progress(&payload);
            }
            Err(OrchestratorError::WorkerGone)
        };

        match timeout(limit, wait).await {
            Ok(Ok(WorkerPayload::Rejected { reason, message })) => {
                Err(OrchestratorError::Rejected { reason, message })
            }
            Ok(result) => result,
            Err(_) => {
                self.pending.lock().await.waiters.remove(&id);
                Err(OrchestratorError::Timeout(limit))
            }
        }
    }
}

/// Routes every response to the waiter of its request id.
async fn response_reader_task(
    mut responses: mpsc::UnboundedReceiver<WorkerResponse>,
    pending: Arc<TokioMutex<Pending>>,
) {
    while let Some(WorkerResponse { id, payload }) = responses.recv().await {
        let mut pending = pending.lock().await;

        let delivered = if payload.is_terminal() {
            pending
                .waiters
                .remove(&id)
                .map(|waiter| waiter.send(payload).is_ok())
        } else {
            pending
                .waiters
                .get(&id)
                .map(|waiter| waiter.send(payload).is_ok())
        };

        if delivered != Some(true) {
            debug!("dropping response to request {} nobody waits for", id);
        }
    }

    // worker is gone: wake every waiter
    let mut pending = pending.lock().await;
    pending.closed = true;
    pending.waiters.clear();
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn unexpected(payload: WorkerPayload) -> OrchestratorError {
    OrchestratorError::UnexpectedPayload(payload.name())
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("another request is still in progress")]
    Busy,

    #[error("worker has not been initialised")]
    NotReady,

    #[error("no image loaded")]
    NoImage,

    #[error("mask is {actual:?}, image is {expected:?}")]
    MaskSize { expected: Size, actual: Size },

    #[error("worker is gone")]
    WorkerGone,

    #[error("no response from worker within {0:?}")]
    Timeout(Duration),

    #[error("worker rejected the request ({reason:?}): {message}")]
    Rejected {
        reason: RejectReason,
        message: String,
    },

    #[error("removal failed: {0}")]
    RemoveFailed(String),

    #[error("worker failed to initialise")]
    InitFailed,

    #[error("unexpected '{0}' response")]
    UnexpectedPayload(&'static str),

    #[error(transparent)]
    Codec(#[from] CodecError),
}
