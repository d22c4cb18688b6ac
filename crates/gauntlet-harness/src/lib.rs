//! Conformance and stress harness for client/server implementations of a
//! reliable, confidential transport over UDP.
//!
//! Drives a black-box subject executable through a fixed CLI contract,
//! injects loopback faults with `tc netem`, and passively verifies wire
//! confidentiality from a pcap artifact. Every trial tears down its own
//! resources — issued ports stay burned for the session, the shaping rule
//! is reverted by an RAII guard, and timed-out subjects are reaped as whole
//! process groups.
//!
//! The netem rule on `lo` is host-global: running two fault-injected trials
//! concurrently is not supported and needs external serialization.

pub mod capture;
pub mod error;
pub mod netem;
pub mod ports;
pub mod process;
pub mod subject;
pub mod test_util;
pub mod trial;

pub use error::HarnessError;
pub use netem::FaultProfile;
pub use subject::Subject;
pub use trial::{Harness, TrialReport, TrialSpec};
