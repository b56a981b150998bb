#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]

pub mod config;
pub mod contract;
pub mod events;
pub mod ledger;
pub mod node;
pub mod poller;
pub mod submitter;
pub mod workflows;

pub use config::Config;
pub use node::OracleNode;
