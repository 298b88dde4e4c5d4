pub mod build;
pub mod cli;
pub mod config;
pub mod context;
pub mod error;
pub mod expand;
pub mod parse;
pub mod pattern;
pub mod runtime;
pub mod store;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cli::BuildCli;
use error::BuildError;

fn main() {
    let build_cli = BuildCli::parse();

    let filter = if build_cli.debug {
        "imgbuild=debug"
    } else {
        "imgbuild=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    if let Err(error) = build_cli.execute() {
        eprintln!("{error:#}");
        let code = error
            .chain()
            .find_map(|e| e.downcast_ref::<BuildError>())
            .map(BuildError::exit_code)
            .unwrap_or(1);
        std::process::exit(code);
    }
}
