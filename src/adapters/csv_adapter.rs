//! CSV file bar feed adapter.
//!
//! One `<SYMBOL>.csv` per symbol with header
//! `timestamp,open,high,low,close,volume`.

use std::fs;
use std::path::PathBuf;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;

use crate::domain::error::TraderError;
use crate::domain::ohlcv::Bar;
use crate::ports::data_port::DataPort;

pub struct CsvAdapter {
    base_path: PathBuf,
}

#[derive(Debug, Deserialize)]
struct CsvRow {
    timestamp: String,
    open: Option<f64>,
    high: Option<f64>,
    low: Option<f64>,
    close: Option<f64>,
    volume: Option<f64>,
}

impl CsvAdapter {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    fn csv_path(&self, symbol: &str) -> PathBuf {
        self.base_path.join(format!("{symbol}.csv"))
    }
}

/// RFC 3339, or a bare `YYYY-MM-DD` taken as midnight UTC.
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, TraderError> {
    let value = value.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
        .ok_or_else(|| TraderError::Data {
            reason: format!("invalid timestamp: {value}"),
        })
}

impl DataPort for CsvAdapter {
    fn fetch_bars(&self, symbol: &str, limit: usize) -> Result<Vec<Bar>, TraderError> {
        let path = self.csv_path(symbol);
        let content = fs::read_to_string(&path).map_err(|e| {
            tracing::debug!(path = %path.display(), error = %e, "csv not readable");
            TraderError::NoData {
                symbol: symbol.to_string(),
            }
        })?;

        let mut rdr = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(content.as_bytes());
        let mut bars = Vec::new();

        for result in rdr.deserialize::<CsvRow>() {
            let row = result.map_err(|e| TraderError::Data {
                reason: format!("CSV parse error in {}: {}", path.display(), e),
            })?;
            let timestamp = parse_timestamp(&row.timestamp)?;

            // rows with a missing price are dropped
            let (Some(open), Some(high), Some(low), Some(close)) =
                (row.open, row.high, row.low, row.close)
            else {
                continue;
            };
            if ![open, high, low, close].iter().all(|v| v.is_finite()) {
                continue;
            }

            let volume = row.volume.unwrap_or(0.0) as i64;
            bars.push(Bar::new(symbol, timestamp, open, high, low, close, volume));
        }

        bars.sort_by_key(|b| b.timestamp);
        if bars.len() > limit {
            bars.drain(..bars.len() - limit);
        }
        Ok(bars)
    }

    fn list_symbols(&self) -> Result<Vec<String>, TraderError> {
        let entries = fs::read_dir(&self.base_path).map_err(|e| TraderError::Data {
            reason: format!(
                "failed to read directory {}: {}",
                self.base_path.display(),
                e
            ),
        })?;

        let mut symbols = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let name_str = name.to_string_lossy();
            if let Some(symbol) = name_str.strip_suffix(".csv") {
                symbols.push(symbol.to_uppercase());
            }
        }

        symbols.sort();
        Ok(symbols)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn setup_test_data() -> (TempDir, PathBuf) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().to_path_buf();

        let csv_content = "timestamp,open,high,low,close,volume\n\
            2024-01-17,2.10,2.20,2.05,2.15,55000\n\
            2024-01-15,2.00,2.10,1.90,2.05,50000\n\
            2024-01-16,2.05,2.15,2.00,2.10,60000\n";

        fs::write(path.join("SNDL.csv"), csv_content).unwrap();
        fs::write(
            path.join("AMC.csv"),
            "timestamp,open,high,low,close,volume\n\
             2024-01-15T14:30:00Z,4.0,4.2,3.9,4.1,1000\n\
             2024-01-16T14:30:00Z,,4.3,4.0,4.2,1100\n",
        )
        .unwrap();
        fs::write(path.join("notes.txt"), "ignored").unwrap();

        (dir, path)
    }

    #[test]
    fn fetch_bars_returns_sorted_data() {
        let (_dir, path) = setup_test_data();
        let adapter = CsvAdapter::new(path);

        let bars = adapter.fetch_bars("SNDL", 100).unwrap();

        assert_eq!(bars.len(), 3);
        assert_eq!(
            bars[0].timestamp,
            Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap()
        );
        assert_eq!(bars[0].symbol, "SNDL");
        assert_eq!(bars[0].open, 2.0);
        assert_eq!(bars[0].high, 2.1);
        assert_eq!(bars[0].low, 1.9);
        assert_eq!(bars[0].close, 2.05);
        assert_eq!(bars[0].volume, 50000);
    }

    #[test]
    fn fetch_bars_keeps_most_recent_limit() {
        let (_dir, path) = setup_test_data();
        let adapter = CsvAdapter::new(path);

        let bars = adapter.fetch_bars("SNDL", 2).unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(
            bars[0].timestamp,
            Utc.with_ymd_and_hms(2024, 1, 16, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn fetch_bars_drops_rows_with_missing_prices() {
        let (_dir, path) = setup_test_data();
        let adapter = CsvAdapter::new(path);

        let bars = adapter.fetch_bars("AMC", 100).unwrap();
        assert_eq!(bars.len(), 1);
        assert_eq!(
            bars[0].timestamp,
            Utc.with_ymd_and_hms(2024, 1, 15, 14, 30, 0).unwrap()
        );
    }

    #[test]
    fn missing_file_is_no_data() {
        let (_dir, path) = setup_test_data();
        let adapter = CsvAdapter::new(path);

        let result = adapter.fetch_bars("XYZ", 10);
        assert!(matches!(result, Err(TraderError::NoData { .. })));
    }

    #[test]
    fn list_symbols_returns_csv_stems() {
        let (_dir, path) = setup_test_data();
        let adapter = CsvAdapter::new(path);

        assert_eq!(adapter.list_symbols().unwrap(), vec!["AMC", "SNDL"]);
    }

    #[test]
    fn timestamp_formats() {
        assert!(parse_timestamp("2024-01-15").is_ok());
        assert!(parse_timestamp("2024-01-15T09:30:00-05:00").is_ok());
        assert!(parse_timestamp("15/01/2024").is_err());
    }
}
