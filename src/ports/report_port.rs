//! Report output port trait.

use crate::domain::error::TraderError;
use crate::domain::metrics::Summary;

/// Port for persisting an aggregate summary at the end of a run.
pub trait ReportPort {
    fn write_summary(&self, summary: &Summary, output_path: &str) -> Result<(), TraderError>;
}
