//! Single-instance coordination over loopback TCP: wire protocol, host-side
//! server, launch-side client and the per-process coordinator.

pub mod client;
pub mod coordinator;
mod error;
pub mod gate;
pub mod protocol;
pub mod runtime;
pub mod server;

pub use client::{Invocation, SingletonClient};
pub use coordinator::{Coordinator, LaunchOutcome};
pub use error::IpcError;
pub use gate::{ActivationGate, PropertyGate};
pub use runtime::{build_runtime, init_tracing};
pub use server::{ServerExit, SingletonServer};
