use alpaca_trader::cli::{Cli, init_tracing, run};
use clap::Parser;

fn main() -> std::process::ExitCode {
    init_tracing();
    run(Cli::parse())
}
