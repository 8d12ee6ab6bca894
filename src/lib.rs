pub mod codec;
pub mod config;
pub mod data_loader;
pub mod engine;
pub mod orchestrator;
pub mod tensor;
pub mod worker;

pub use crate::codec::{PadBox, PixelRange, Size, TensorCodec};
pub use crate::config::WorkerConfig;
pub use crate::engine::{ExecutionTarget, InferenceEngine};
pub use crate::orchestrator::{Orchestrator, OrchestratorError};
pub use crate::tensor::{DataType, Tensor, TensorError};
pub use crate::worker::{spawn_worker, WorkerHandle, WorkerState};
