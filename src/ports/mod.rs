//! Port trait definitions for hexagonal architecture.

pub mod config_port;
pub mod data_port;
pub mod report_port;
pub mod broker_port;
pub mod stream_port;
