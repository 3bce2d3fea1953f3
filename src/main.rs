//! pw-lambda - run a shell command as a real-time PipeWire audio filter
//!
//! Audio sent to the `lambda_sink` node is written to the command's stdin as
//! raw interleaved samples; whatever the command prints to stdout is played
//! from the `lambda_source` node.

mod audio;
mod bridge;
mod cli;
mod config;
mod error;
mod lambda;
mod pipewire;

use clap::Parser;
use clap::error::ErrorKind;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = match cli::Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    let config = match args.resolve() {
        Ok(config) => config,
        Err(e) => {
            log::error!("{}", e);
            std::process::exit(1);
        }
    };

    log::info!(
        "Starting pw-lambda: `{}` ({} Hz, {} channels, {})",
        config.command,
        config.rate,
        config.channels,
        config.format
    );

    if let Err(e) = pipewire::run(&config) {
        log::error!("{}", e);
        std::process::exit(1);
    }
}
