//! Configuration validation.
//!
//! Validates config fields before a backtest or a trading session starts.

use crate::domain::error::TraderError;
use crate::domain::universe::parse_symbols;
use crate::ports::config_port::ConfigPort;

pub const KNOWN_STRATEGIES: &[&str] = &["smokestack"];

pub fn validate_backtest_config(config: &dyn ConfigPort) -> Result<(), TraderError> {
    validate_price_band(config)?;
    validate_slippage(config, "entry_slippage")?;
    validate_slippage(config, "exit_slippage")?;
    validate_min_periods(config)?;
    validate_symbols(config, "backtest")?;
    Ok(())
}

pub fn validate_strategy_config(config: &dyn ConfigPort) -> Result<(), TraderError> {
    validate_strategy_name(config)?;
    validate_take_profit(config)?;
    validate_stop_loss(config)?;
    validate_max_positions(config)?;
    validate_windows(config)?;
    Ok(())
}

pub fn validate_live_config(config: &dyn ConfigPort) -> Result<(), TraderError> {
    validate_symbols(config, "live")?;
    if config.get_int("live", "iterate_every", 60) < 1 {
        return Err(invalid("live", "iterate_every", "iterate_every must be at least 1 second"));
    }
    if config.get_int("live", "needed_periods", 8) < 1 {
        return Err(invalid("live", "needed_periods", "needed_periods must be at least 1"));
    }
    if config.get_int("live", "data_limit", 200) < 1 {
        return Err(invalid("live", "data_limit", "data_limit must be at least 1"));
    }
    Ok(())
}

fn invalid(section: &str, key: &str, reason: &str) -> TraderError {
    TraderError::ConfigInvalid {
        section: section.to_string(),
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

fn validate_price_band(config: &dyn ConfigPort) -> Result<(), TraderError> {
    let min = config.get_double("backtest", "min_price", 1.0);
    let max = config.get_double("backtest", "max_price", 100.0);
    if min < 0.0 {
        return Err(invalid("backtest", "min_price", "min_price must be non-negative"));
    }
    if min >= max {
        return Err(invalid("backtest", "max_price", "max_price must be above min_price"));
    }
    Ok(())
}

fn validate_slippage(config: &dyn ConfigPort, key: &str) -> Result<(), TraderError> {
    let value = config.get_double("backtest", key, 0.005);
    if !(0.0..1.0).contains(&value) {
        return Err(invalid("backtest", key, "slippage must be in [0, 1)"));
    }
    Ok(())
}

fn validate_min_periods(config: &dyn ConfigPort) -> Result<(), TraderError> {
    if config.get_int("backtest", "min_periods", 5) < 2 {
        return Err(invalid("backtest", "min_periods", "min_periods must be at least 2"));
    }
    Ok(())
}

fn validate_symbols(config: &dyn ConfigPort, section: &str) -> Result<(), TraderError> {
    match config.get_string(section, "symbols") {
        Some(s) if !s.trim().is_empty() => parse_symbols(&s)
            .map(|_| ())
            .map_err(|e| invalid(section, "symbols", &e.to_string())),
        _ => Err(TraderError::ConfigMissing {
            section: section.to_string(),
            key: "symbols".to_string(),
        }),
    }
}

fn validate_strategy_name(config: &dyn ConfigPort) -> Result<(), TraderError> {
    let name = config.get_string_or("strategy", "name", "smokestack");
    if !KNOWN_STRATEGIES.contains(&name.trim().to_lowercase().as_str()) {
        return Err(invalid(
            "strategy",
            "name",
            &format!("unknown strategy '{}'", name.trim()),
        ));
    }
    Ok(())
}

fn validate_take_profit(config: &dyn ConfigPort) -> Result<(), TraderError> {
    let value = config.get_double("strategy", "take_profit", 1.10);
    if value <= 1.0 {
        return Err(invalid("strategy", "take_profit", "take_profit must be greater than 1"));
    }
    Ok(())
}

fn validate_stop_loss(config: &dyn ConfigPort) -> Result<(), TraderError> {
    let value = config.get_double("strategy", "stop_loss", 0.97);
    if value <= 0.0 || value >= 1.0 {
        return Err(invalid("strategy", "stop_loss", "stop_loss must be between 0 and 1"));
    }
    Ok(())
}

fn validate_max_positions(config: &dyn ConfigPort) -> Result<(), TraderError> {
    if config.get_int("strategy", "max_positions", 4) < 1 {
        return Err(invalid("strategy", "max_positions", "max_positions must be at least 1"));
    }
    Ok(())
}

fn validate_windows(config: &dyn ConfigPort) -> Result<(), TraderError> {
    for (key, default) in [
        ("short_sma", 20),
        ("long_sma", 200),
        ("atr_period", 14),
        ("atr_sma", 10),
        ("lookback", 5),
    ] {
        if config.get_int("strategy", key, default) < 1 {
            return Err(invalid("strategy", key, "window length must be at least 1"));
        }
    }
    if config.get_double("strategy", "drop_pct", 15.0) < 0.0 {
        return Err(invalid("strategy", "drop_pct", "drop_pct must be non-negative"));
    }
    Ok(())
}
