//! Deterministic simulation harness for the Granite consensus core.
//!
//! Participants run synchronously against an in-memory network with
//! configurable latency. All scheduling flows through a single event queue
//! ordered by (time, sequence), so a given seed always produces identical
//! results. Signing uses a keyed-hash stand-in for BLS: the real scheme is
//! an external collaborator of the core and irrelevant to protocol logic.

mod host;
mod network;
mod runner;
mod signing;

pub use host::SimHost;
pub use network::NetworkConfig;
pub use runner::{SimBuilder, SimRunner, SimStats};
pub use signing::SigningBackend;
