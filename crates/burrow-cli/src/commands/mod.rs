//! One module per `burrow` subcommand.

pub mod client;
pub mod forwarder;
pub mod lan;
pub mod list;
pub mod users;
