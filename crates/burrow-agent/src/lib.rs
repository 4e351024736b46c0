//! burrow-agent: client-side library for the burrow tunnel.
//!
//! Holds the control stream to the rendezvous server and performs the
//! dial-back dance for each pairing event.

pub mod agent;
pub mod control;

pub use agent::{run, AgentConfig};
pub use control::{call, ControlStream};
