//! Message types exchanged between the orchestrator and an inpainting worker.
//!
//! Every message is a `{"type": ..., "data": ...}` object with camelCase tags.
//! Requests and responses travel in envelopes carrying the request id, so a
//! caller can correlate each terminal payload with the request that caused it.

use crate::tensor::Tensor;
use serde::{Deserialize, Serialize};

/// Request sent to the worker.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkerRequest {
    /// Correlates the responses of this request. 0 is reserved for frames
    /// whose id could not be read.
    pub id: u64,
    pub command: WorkerCommand,
}

impl WorkerRequest {
    pub fn new(id: u64, command: WorkerCommand) -> Self {
        WorkerRequest { id, command }
    }

    /// Decode a raw JSON frame. Unknown tags and malformed bodies are
    /// protocol faults.
    pub fn from_json(text: &str) -> Result<Self, ProtocolFaultError> {
        serde_json::from_str(text).map_err(|e| ProtocolFaultError {
            id: request_id_hint(text),
            message: e.to_string(),
        })
    }
}

/// Best effort extraction of `id` from a frame that failed to decode.
fn request_id_hint(text: &str) -> u64 {
    serde_json::from_str::<serde_json::Value>(text)
        .ok()
        .and_then(|value| value.get("id").and_then(serde_json::Value::as_u64))
        .unwrap_or(0)
}

/// Commands the worker understands.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum WorkerCommand {
    /// Download the model if needed and create the session.
    Ping,
    /// Inpaint the masked region of an image, both in engine layout.
    RunRemove {
        #[serde(rename = "imgArray")]
        img_array: Vec<f32>,
        #[serde(rename = "imgArrayShape")]
        img_array_shape: Vec<usize>,
        #[serde(rename = "maskArray")]
        mask_array: Vec<f32>,
        #[serde(rename = "maskArrayShape")]
        mask_array_shape: Vec<usize>,
    },
}

impl WorkerCommand {
    /// Build a `runRemove` from the two engine tensors.
    pub fn run_remove(image: Tensor, mask: Tensor) -> Self {
        let (img_array_shape, img_array) = image.into_parts();
        let (mask_array_shape, mask_array) = mask.into_parts();
        WorkerCommand::RunRemove {
            img_array,
            img_array_shape,
            mask_array,
            mask_array_shape,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            WorkerCommand::Ping => "ping",
            WorkerCommand::RunRemove { .. } => "runRemove",
        }
    }
}

/// Response sent by the worker.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkerResponse {
    /// Matches the request id
    pub id: u64,
    pub payload: WorkerPayload,
}

/// Response payloads from the worker.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum WorkerPayload {
    DownloadInProgress,
    LoadingInProgress,
    DownloadProgress {
        received: u64,
        total: Option<u64>,
    },
    /// Outcome of initialisation; `device` names the execution target that
    /// hosts the session.
    Pong {
        success: bool,
        device: Option<String>,
    },
    /// Inpainted image, `[1, 3, H, W]`.
    RemoveDone(Tensor),
    RemoveFailed {
        message: String,
    },
    Rejected {
        reason: RejectReason,
        message: String,
    },
}

impl WorkerPayload {
    /// Terminal payloads end a request; each request gets exactly one.
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            WorkerPayload::DownloadInProgress
                | WorkerPayload::LoadingInProgress
                | WorkerPayload::DownloadProgress { .. }
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            WorkerPayload::DownloadInProgress => "downloadInProgress",
            WorkerPayload::LoadingInProgress => "loadingInProgress",
            WorkerPayload::DownloadProgress { .. } => "downloadProgress",
            WorkerPayload::Pong { .. } => "pong",
            WorkerPayload::RemoveDone(_) => "removeDone",
            WorkerPayload::RemoveFailed { .. } => "removeFailed",
            WorkerPayload::Rejected { .. } => "rejected",
        }
    }
}

/// Why a request was refused without being acted upon.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum RejectReason {
    NotReady,
    AlreadyInitialized,
    ProtocolFault,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("protocol fault in request {id}: {message}")]
pub struct ProtocolFaultError {
    pub id: u64,
    pub message: String,
}
