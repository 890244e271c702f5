//! CLI definition and dispatch.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use crate::adapters::alpaca_rest_adapter::{AlpacaCredentials, AlpacaRestAdapter};
use crate::adapters::alpaca_stream_adapter::{AlpacaStreamAdapter, STREAM_URL};
use crate::adapters::csv_adapter::CsvAdapter;
use crate::adapters::file_config_adapter::FileConfigAdapter;
use crate::adapters::json_report_adapter::JsonReportAdapter;
use crate::domain::backtest::{BacktestConfig, BacktestResult, run_backtest};
use crate::domain::config_validation::{
    KNOWN_STRATEGIES, validate_backtest_config, validate_live_config, validate_strategy_config,
};
use crate::domain::error::TraderError;
use crate::domain::execution::{ExitRules, Slippage};
use crate::domain::strategy::{SmokestackParams, Strategy, smokestack};
use crate::domain::universe::{parse_symbols, validate_universe};
use crate::live::trader::{LiveTrader, TraderConfig};
use crate::ports::config_port::ConfigPort;
use crate::ports::data_port::DataPort;
use crate::ports::report_port::ReportPort;

#[derive(Parser, Debug)]
#[command(name = "alpaca-trader", about = "Take-profit/stop-loss backtester and live trader")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Replay CSV bars through the strategy and write a JSON summary
    Backtest {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long)]
        data_dir: Option<PathBuf>,
        /// Comma-separated symbols, overriding [backtest] symbols
        #[arg(long)]
        symbols: Option<String>,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Trade live against the broker until interrupted
    Trade {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Validate a configuration file
    Validate {
        #[arg(short, long)]
        config: PathBuf,
    },
}

/// Install the global subscriber. `RUST_LOG` overrides the `info` default.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

pub fn run(cli: Cli) -> ExitCode {
    let result = match cli.command {
        Command::Backtest {
            config,
            data_dir,
            symbols,
            output,
        } => run_backtest_command(&config, data_dir, symbols.as_deref(), output),
        Command::Trade { config } => run_trade(&config),
        Command::Validate { config } => run_validate(&config),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            (&e).into()
        }
    }
}

pub fn load_config(path: &Path) -> Result<FileConfigAdapter, TraderError> {
    Ok(FileConfigAdapter::from_file(path)?.with_env_overrides())
}

pub fn build_exit_rules(config: &dyn ConfigPort) -> ExitRules {
    let defaults = ExitRules::default();
    ExitRules {
        take_profit: config.get_double("strategy", "take_profit", defaults.take_profit),
        stop_loss: config.get_double("strategy", "stop_loss", defaults.stop_loss),
    }
}

pub fn build_backtest_config(config: &dyn ConfigPort) -> BacktestConfig {
    let defaults = BacktestConfig::default();
    let slippage = Slippage::default();
    BacktestConfig {
        min_price: config.get_double("backtest", "min_price", defaults.min_price),
        max_price: config.get_double("backtest", "max_price", defaults.max_price),
        min_periods: config.get_int("backtest", "min_periods", defaults.min_periods as i64).max(0)
            as usize,
        exit_rules: build_exit_rules(config),
        slippage: Slippage {
            entry_markup: config.get_double("backtest", "entry_slippage", slippage.entry_markup),
            exit_discount: config.get_double("backtest", "exit_slippage", slippage.exit_discount),
            round_entry: config.get_bool("backtest", "round_entry", slippage.round_entry),
        },
    }
}

fn get_usize(config: &dyn ConfigPort, section: &str, key: &str, default: usize) -> usize {
    config.get_int(section, key, default as i64).max(0) as usize
}

pub fn build_strategy(config: &dyn ConfigPort) -> Result<Strategy, TraderError> {
    let name = config.get_string_or("strategy", "name", "smokestack");
    match name.trim().to_lowercase().as_str() {
        "smokestack" => {
            let d = SmokestackParams::default();
            Ok(smokestack(SmokestackParams {
                short_sma: get_usize(config, "strategy", "short_sma", d.short_sma),
                long_sma: get_usize(config, "strategy", "long_sma", d.long_sma),
                atr_period: get_usize(config, "strategy", "atr_period", d.atr_period),
                atr_sma: get_usize(config, "strategy", "atr_sma", d.atr_sma),
                drop_pct: config.get_double("strategy", "drop_pct", d.drop_pct),
                lookback: get_usize(config, "strategy", "lookback", d.lookback),
                minimum_volatility: config.get_double(
                    "strategy",
                    "minimum_volatility",
                    d.minimum_volatility,
                ),
                max_positions: get_usize(config, "strategy", "max_positions", d.max_positions),
            }))
        }
        other => Err(TraderError::ConfigInvalid {
            section: "strategy".into(),
            key: "name".into(),
            reason: format!(
                "unknown strategy '{other}' (known: {})",
                KNOWN_STRATEGIES.join(", ")
            ),
        }),
    }
}

pub fn build_trader_config(config: &dyn ConfigPort) -> Result<TraderConfig, TraderError> {
    let d = TraderConfig::default();
    let symbols = resolve_symbols(None, config, "live")?;
    Ok(TraderConfig {
        symbols,
        timeframe: config.get_string_or("live", "timeframe", &d.timeframe),
        data_limit: get_usize(config, "live", "data_limit", d.data_limit),
        needed_periods: get_usize(config, "live", "needed_periods", d.needed_periods),
        allow_daytrading: config.get_bool("live", "allow_daytrading", d.allow_daytrading),
        iterate_every: Duration::from_secs(
            config
                .get_int("live", "iterate_every", d.iterate_every.as_secs() as i64)
                .max(1) as u64,
        ),
        run_during_market: config.get_bool("live", "run_during_market", d.run_during_market),
        minutes_till_close: config.get_int("live", "minutes_till_close", d.minutes_till_close),
        max_positions: get_usize(config, "strategy", "max_positions", d.max_positions),
        exit_rules: build_exit_rules(config),
    })
}

pub fn alpaca_credentials(config: &dyn ConfigPort) -> Result<AlpacaCredentials, TraderError> {
    let required = |key: &str| {
        config
            .get_string("alpaca", key)
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| TraderError::ConfigMissing {
                section: "alpaca".into(),
                key: key.into(),
            })
    };
    Ok(AlpacaCredentials {
        key_id: required("key_id")?,
        secret_key: required("secret_key")?,
    })
}

/// The override when given, otherwise `[section] symbols`.
pub fn resolve_symbols(
    override_symbols: Option<&str>,
    config: &dyn ConfigPort,
    section: &str,
) -> Result<Vec<String>, TraderError> {
    let raw = match override_symbols {
        Some(s) => s.to_string(),
        None => config
            .get_string(section, "symbols")
            .ok_or_else(|| TraderError::ConfigMissing {
                section: section.into(),
                key: "symbols".into(),
            })?,
    };
    parse_symbols(&raw).map_err(|e| TraderError::ConfigInvalid {
        section: section.into(),
        key: "symbols".into(),
        reason: e.to_string(),
    })
}

pub fn run_backtest_command(
    config_path: &Path,
    data_dir: Option<PathBuf>,
    symbols_override: Option<&str>,
    output_override: Option<PathBuf>,
) -> Result<(), TraderError> {
    eprintln!("Loading config from {}", config_path.display());
    let config = load_config(config_path)?;
    validate_strategy_config(&config)?;
    if symbols_override.is_none() {
        validate_backtest_config(&config)?;
    }

    let strategy = build_strategy(&config)?;
    let bt_config = build_backtest_config(&config);
    let symbols = resolve_symbols(symbols_override, &config, "backtest")?;
    let data_dir = data_dir
        .unwrap_or_else(|| PathBuf::from(config.get_string_or("backtest", "data_dir", "data")));
    let output = output_override.unwrap_or_else(|| {
        PathBuf::from(config.get_string_or("backtest", "output", "summary.json"))
    });
    let data_limit = get_usize(&config, "backtest", "data_limit", 1000);

    eprintln!(
        "Running {} on {} symbols from {}",
        strategy.name,
        symbols.len(),
        data_dir.display()
    );
    let feed = CsvAdapter::new(data_dir);
    let result = run_backtest_pipeline(&feed, symbols, &strategy, &bt_config, data_limit)?;
    print_summary(&result);

    JsonReportAdapter::new().write_summary(&result.summary(), &output.to_string_lossy())?;
    eprintln!("\nSummary written to: {}", output.display());
    Ok(())
}

/// Validate the universe, replay it, and return the per-symbol runs.
pub fn run_backtest_pipeline(
    feed: &dyn DataPort,
    symbols: Vec<String>,
    strategy: &Strategy,
    bt_config: &BacktestConfig,
    data_limit: usize,
) -> Result<BacktestResult, TraderError> {
    let validation = validate_universe(feed, symbols, data_limit, bt_config.min_periods)?;
    let mut result = run_backtest(&validation.bars, strategy, bt_config);
    let mut skipped = validation.skipped;
    skipped.append(&mut result.skipped);
    result.skipped = skipped;
    Ok(result)
}

pub fn print_summary(result: &BacktestResult) {
    let summary = result.summary();
    eprintln!("\n=== Backtest Results ===");
    if let Some(since) = summary.data_since {
        eprintln!("Data Since:       {}", since.format("%Y-%m-%d"));
    }
    eprintln!("Symbols:          {}", result.runs.len());
    eprintln!("Total Trades:     {}", summary.total_trades());
    eprintln!("Win Rate:         {:.1}%", summary.win_rate() * 100.0);
    eprintln!("Overall Return:   {:.4}", summary.overall_return);
    if let Some(last) = result.curve().last() {
        eprintln!(
            "Curve Return:     {:.4} (through {})",
            last.cumulative,
            last.timestamp.format("%Y-%m-%d")
        );
    }
    eprintln!(
        "Successes:        {} (avg {:+.2}%, best {:+.2}%, avg {:.1} bars, longest {})",
        summary.success_trades,
        summary.avg_success_trade * 100.0,
        summary.largest_success_trade * 100.0,
        summary.avg_time_in_success_trade,
        summary.longest_time_in_success_trade,
    );
    eprintln!(
        "Failures:         {} (avg {:+.2}%, worst {:+.2}%, avg {:.1} bars, longest {})",
        summary.failed_trades,
        summary.avg_failed_trade * 100.0,
        summary.largest_failed_trade * 100.0,
        summary.avg_time_in_failed_trade,
        summary.longest_time_in_failed_trade,
    );
    eprintln!("Discarded:        {}", result.discarded_trades());
    eprintln!("Incomplete:       {}", result.incomplete_trades());

    if !result.skipped.is_empty() {
        eprintln!("\n=== Skipped Symbols ===");
        for skipped in &result.skipped {
            eprintln!("  {}: {}", skipped.symbol, skipped.reason);
        }
    }
}

fn run_trade(config_path: &Path) -> Result<(), TraderError> {
    let config = load_config(config_path)?;
    validate_strategy_config(&config)?;
    validate_live_config(&config)?;

    let strategy = build_strategy(&config)?;
    let trader_config = build_trader_config(&config)?;
    let credentials = alpaca_credentials(&config)?;
    let paper = config.get_bool("alpaca", "paper", true);
    let stream_url = config.get_string_or("alpaca", "stream_url", STREAM_URL);

    let broker = Arc::new(AlpacaRestAdapter::new(credentials.clone(), paper)?);
    let stream = Arc::new(AlpacaStreamAdapter::with_url(credentials, &stream_url));
    eprintln!(
        "Trading {} symbols against {}",
        trader_config.symbols.len(),
        broker.base_url()
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async move {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("ctrl-c received");
            }
            let _ = shutdown_tx.send(true);
        });

        LiveTrader::new(trader_config, strategy, broker, stream)
            .run(shutdown_rx)
            .await;
    });
    Ok(())
}

pub fn run_validate(config_path: &Path) -> Result<(), TraderError> {
    eprintln!("Validating config: {}", config_path.display());
    let config = load_config(config_path)?;

    validate_strategy_config(&config)?;
    let strategy = build_strategy(&config)?;
    let rules = build_exit_rules(&config);
    eprintln!(
        "  strategy:  {} (take_profit {}, stop_loss {})",
        strategy.name, rules.take_profit, rules.stop_loss
    );

    let mut sections = 0;
    if config.get_string("backtest", "symbols").is_some() {
        validate_backtest_config(&config)?;
        let symbols = resolve_symbols(None, &config, "backtest")?;
        eprintln!("  backtest:  {} symbols", symbols.len());
        sections += 1;
    }
    if config.get_string("live", "symbols").is_some() {
        validate_live_config(&config)?;
        let trader = build_trader_config(&config)?;
        eprintln!(
            "  live:      {} symbols, {} bars every {}s",
            trader.symbols.len(),
            trader.timeframe,
            trader.iterate_every.as_secs()
        );
        sections += 1;
    }
    if sections == 0 {
        return Err(TraderError::ConfigMissing {
            section: "backtest".into(),
            key: "symbols".into(),
        });
    }

    eprintln!("\nConfiguration is valid");
    Ok(())
}
