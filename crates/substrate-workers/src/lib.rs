//! Agent Worker (C9), Inference Worker (C10), and GPU Admission (C11).

pub mod agent_worker;
pub mod gpu;
pub mod inference_worker;
pub mod model_runner;

pub use agent_worker::{AgentConfigLoader, AgentWorker};
pub use gpu::{DeviceDescriptor, GpuAdmission};
pub use inference_worker::InferenceWorker;
pub use model_runner::{ChatMessage, ChatResult, ChatUsage, ModelRunner, TokenSink};
