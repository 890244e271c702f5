//! Domain error types.

/// Top-level error type for alpaca-trader.
#[derive(Debug, thiserror::Error)]
pub enum TraderError {
    #[error("config parse error in {file}: {reason}")]
    ConfigParse { file: String, reason: String },

    #[error("missing config key [{section}] {key}")]
    ConfigMissing { section: String, key: String },

    #[error("invalid config value [{section}] {key}: {reason}")]
    ConfigInvalid {
        section: String,
        key: String,
        reason: String,
    },

    #[error("data error: {reason}")]
    Data { reason: String },

    #[error("no data for {symbol}")]
    NoData { symbol: String },

    #[error("insufficient data for {symbol}: have {bars} bars, need {minimum}")]
    InsufficientData {
        symbol: String,
        bars: usize,
        minimum: usize,
    },

    #[error("broker error: {reason}")]
    Broker { reason: String },

    #[error("stream error: {reason}")]
    Stream { reason: String },

    #[error("{symbol}: cannot {operation} while {state}")]
    InvalidTransition {
        symbol: String,
        state: String,
        operation: String,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl From<&TraderError> for std::process::ExitCode {
    fn from(err: &TraderError) -> Self {
        let code: u8 = match err {
            TraderError::Io(_) | TraderError::Json(_) => 1,
            TraderError::ConfigParse { .. }
            | TraderError::ConfigMissing { .. }
            | TraderError::ConfigInvalid { .. } => 2,
            TraderError::Data { .. }
            | TraderError::NoData { .. }
            | TraderError::InsufficientData { .. } => 5,
            TraderError::Broker { .. } | TraderError::Stream { .. } => 6,
            TraderError::InvalidTransition { .. } => 7,
        };
        std::process::ExitCode::from(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_data_message_names_both_counts() {
        let err = TraderError::InsufficientData {
            symbol: "SNDL".into(),
            bars: 3,
            minimum: 5,
        };
        assert_eq!(
            err.to_string(),
            "insufficient data for SNDL: have 3 bars, need 5"
        );
    }

    #[test]
    fn invalid_transition_message() {
        let err = TraderError::InvalidTransition {
            symbol: "AMC".into(),
            state: "OPEN".into(),
            operation: "open_trade".into(),
        };
        assert_eq!(err.to_string(), "AMC: cannot open_trade while OPEN");
    }
}
