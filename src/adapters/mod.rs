//! Concrete adapter implementations for ports.

pub mod alpaca_rest_adapter;
pub mod alpaca_stream_adapter;
pub mod csv_adapter;
pub mod file_config_adapter;
pub mod json_report_adapter;
