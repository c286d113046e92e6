//! Inference: admission control and the blocking-to-async bridge
//!
//! - [`bridge`]: runs one blocking model call on a worker thread and exposes
//!   its output as an async stream
//! - [`gate`]: priority-ordered counting limiter
//! - [`admission`]: lazy model load, slot acquisition, safe output length and
//!   per-request deadlines

pub mod admission;
pub mod bridge;
pub mod gate;

pub use admission::{
    AdmissionConfig, AdmissionController, AdmissionError, AdmissionStats, GenerationFragment,
    GenerationRequest, GenerationStream, OverloadPolicy, RequestState,
};
pub use bridge::{BridgeError, BridgeEvent, BridgeReceiver, CancellationFlag};
pub use gate::{GateError, GatePermit, Priority, PriorityGate};
