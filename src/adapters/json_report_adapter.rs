//! JSON report adapter implementing ReportPort.

use std::fs;
use std::path::Path;

use crate::domain::error::TraderError;
use crate::domain::metrics::Summary;
use crate::ports::report_port::ReportPort;

#[derive(Debug, Default)]
pub struct JsonReportAdapter;

impl JsonReportAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl ReportPort for JsonReportAdapter {
    fn write_summary(&self, summary: &Summary, output_path: &str) -> Result<(), TraderError> {
        let path = Path::new(output_path);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(summary)?;
        fs::write(path, json + "\n")?;
        tracing::info!(path = %path.display(), "summary written");
        Ok(())
    }
}
