//! Granite (GossiPBFT) consensus core.
//!
//! A [`Participant`] runs repeated, bounded consensus *instances* over a
//! growing EC chain to produce a monotonic sequence of finality decisions,
//! each justified by an aggregate signature from a strong quorum of a known,
//! weighted participant set.
//!
//! # Architecture
//!
//! The core is a **single-threaded, synchronous** consumer of two inputs:
//! validated messages and alarm fires. A call enters with a single event,
//! mutates state to a consistent point, and returns; all I/O flows through
//! the narrow [`host`] capability traits (chain/committee lookup, signing,
//! broadcast, clock, decision sink). This keeps the core deterministic given
//! its inputs and lock-free.
//!
//! ```text
//! validate_message() ──► ValidatedMessage ──► receive_message() ─┐
//!                                                                ├─► Instance
//! receive_alarm() ───────────────────────────────────────────────┘
//! ```
//!
//! Message validation reads only per-instance immutable state and the
//! verifier capability, so callers may fan it out across threads before
//! handing the resulting [`ValidatedMessage`] tokens to the core.
//!
//! # Per-instance protocol
//!
//! Each instance advances through QUALITY → (CONVERGE → PREPARE → COMMIT)*
//! → DECIDE → TERMINATED, driven by quorum observations and a single-timer
//! alarm, and terminates with a [`Justification`](granite_types::Justification)
//! carrying an aggregate signature from >⅔ of the participant power.

mod config;
mod converge;
mod error;
mod instance;
mod participant;
mod quorum;
#[cfg(test)]
mod testing;
mod validator;

pub mod host;
pub mod vrf;

pub use config::GraniteConfig;
pub use error::{GpbftError, HostError};
pub use host::{
    Chain, Clock, DecisionReceiver, Host, MessageBuilder, Network, SignatureBuilder, Signer,
    Verifier,
};
pub use participant::{Participant, ValidatedMessage};
pub use validator::validate_message;
