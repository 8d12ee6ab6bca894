mod tract;

pub use self::tract::{TractBackend, TractSession};

use crate::tensor::{NamedTensors, ShapeMismatchError};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

/// Name of the colour image input of the LaMa graph
pub const IMAGE_INPUT: &str = "image";

/// Name of the mask input of the LaMa graph
pub const MASK_INPUT: &str = "mask";

/// ExecutionTarget
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionTarget {
    #[default]
    Cpu,
    Gpu,
    WebGpu,
    Npu,
    Tpu,
}

impl ExecutionTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionTarget::Cpu => "cpu",
            ExecutionTarget::Gpu => "gpu",
            ExecutionTarget::WebGpu => "webgpu",
            ExecutionTarget::Npu => "npu",
            ExecutionTarget::Tpu => "tpu",
        }
    }
}

impl fmt::Display for ExecutionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionTarget {
    type Err = InferenceError;

    fn from_str(et: &str) -> Result<Self, Self::Err> {
        match et.to_lowercase().as_str() {
            "cpu" => Ok(ExecutionTarget::Cpu),
            "gpu" | "cuda" => Ok(ExecutionTarget::Gpu),
            "webgpu" => Ok(ExecutionTarget::WebGpu),
            "npu" => Ok(ExecutionTarget::Npu),
            "tpu" => Ok(ExecutionTarget::Tpu),
            _ => {
                log::warn!("invalid execution target detected: '{}'", et);
                Err(InferenceError::UnknownExecutionTarget(et.to_string()))
            }
        }
    }
}

/// A ready-to-run model bound to one execution target.
pub trait InferenceSession: Send + Sync {
    fn target(&self) -> ExecutionTarget;

    fn input_names(&self) -> &[String];

    fn output_names(&self) -> &[String];

    /// Run the model once. Blocks for the duration of the computation, so
    /// callers on an async runtime go through `spawn_blocking`.
    fn infer(&self, inputs: NamedTensors) -> InferenceResult<NamedTensors>;
}

/// Compute backend able to build sessions from serialized model bytes.
pub trait InferenceBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn create_session(
        &self,
        model: &[u8],
        target: ExecutionTarget,
    ) -> InferenceResult<Arc<dyn InferenceSession>>;
}

/// Why constructing a session on one target failed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TargetFailure {
    pub target: ExecutionTarget,
    pub reason: String,
}

impl fmt::Display for TargetFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.target, self.reason)
    }
}

/// Owns the one session of a worker.
///
/// Targets are tried in preference order; the first session that can be
/// built is memoised and handed out for every later call.
pub struct InferenceEngine {
    backend: Box<dyn InferenceBackend>,
    session: Mutex<Option<Arc<dyn InferenceSession>>>,
}

impl InferenceEngine {
    pub fn new(backend: Box<dyn InferenceBackend>) -> Self {
        InferenceEngine {
            backend,
            session: Mutex::new(None),
        }
    }

    pub fn with_tract(image_size: u32) -> Self {
        Self::new(Box::new(TractBackend::new(image_size)))
    }

    /// The memoised session, if one was created.
    pub fn session(&self) -> Option<Arc<dyn InferenceSession>> {
        self.session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn create_session(
        &self,
        model: &Bytes,
        targets: &[ExecutionTarget],
    ) -> InferenceResult<(Arc<dyn InferenceSession>, ExecutionTarget)> {
        let mut slot = self
            .session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(session) = slot.as_ref() {
            log::debug!(
                "create_session() - reusing session on '{}'",
                session.target()
            );
            return Ok((session.clone(), session.target()));
        }

        let mut attempts = Vec::with_capacity(targets.len());

        for &target in targets {
            log::info!(
                "create_session() - loading model on '{}' with backend '{}'",
                target,
                self.backend.name()
            );

            match self.backend.create_session(model, target) {
                Ok(session) => {
                    *slot = Some(session.clone());
                    return Ok((session, target));
                }
                Err(error) => {
                    log::error!(
                        "create_session() - target '{}' failed: {}",
                        target,
                        error
                    );
                    attempts.push(TargetFailure {
                        target,
                        reason: error.to_string(),
                    });
                }
            }
        }

        Err(InferenceError::SessionCreation { attempts })
    }

    /// Run the memoised session.
    pub fn infer(&self, inputs: NamedTensors) -> InferenceResult<NamedTensors> {
        let session = self.session().ok_or(InferenceError::NoSession)?;
        infer_checked(session.as_ref(), inputs)
    }
}

/// Check every declared input is present before handing over to the backend.
pub fn infer_checked(
    session: &dyn InferenceSession,
    inputs: NamedTensors,
) -> InferenceResult<NamedTensors> {
    if let Some(missing) = session
        .input_names()
        .iter()
        .find(|name| !inputs.contains_key(name.as_str()))
    {
        return Err(InferenceError::MissingInput(missing.clone()));
    }

    session.infer(inputs)
}

/// InferenceResult
pub type InferenceResult<T> = Result<T, InferenceError>;

#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("runtime error: {0}")]
    RuntimeError(String),

    #[error("no execution target could host the model: [{}]", format_attempts(.attempts))]
    SessionCreation { attempts: Vec<TargetFailure> },

    #[error("no session has been created")]
    NoSession,

    #[error("Unsupported ExecutionTarget '{0}'")]
    UnsupportedExecutionTarget(ExecutionTarget),

    #[error("Unknown ExecutionTarget '{0}'")]
    UnknownExecutionTarget(String),

    #[error("Failed to build model from buffer: {0}")]
    FailedToBuildModelFromBuffer(String),

    #[error("missing input tensor '{0}'")]
    MissingInput(String),

    #[error("Corrupt input tensor: {0}")]
    ShapeMismatch(#[from] ShapeMismatchError),

    #[error("Configuration of model's input type and/or shape failed: {0}")]
    CorruptInputTypeOrShape(#[from] tract_onnx::prelude::TractError),
}

fn format_attempts(attempts: &[TargetFailure]) -> String {
    attempts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
