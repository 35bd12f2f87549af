//! converge - declarative host convergence
//!
//! This is the main entry point for the converge CLI.

mod cli;

use anyhow::Result;
use cli::commands::CommandContext;
use cli::{Cli, Commands, LogFormat};
use converge::config::Config;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Application version information
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();

    init_logging(cli.verbosity(), cli.log_format);

    if cli.verbosity() >= 2 {
        eprintln!("converge v{}", VERSION);
    }

    let config = match Config::load(cli.config.as_ref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(converge::Error::Config(e.to_string()).exit_code());
        }
    };

    let mut ctx = CommandContext::new(&cli, config);

    let outcome = match &cli.command {
        Commands::Run(args) => args.execute(&mut ctx).await,
        Commands::Check(args) => args.execute(&mut ctx).await,
        Commands::ListHosts(args) => args.execute(&mut ctx).await,
    };

    let exit_code = match outcome {
        Ok(code) => code,
        Err(e) => {
            ctx.output.error(&format!("{:#}", e));
            e.downcast_ref::<converge::Error>()
                .map_or(1, converge::Error::exit_code)
        }
    };

    std::process::exit(exit_code);
}

/// Initialize logging based on verbosity level
fn init_logging(verbosity: u8, format: LogFormat) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    let registry = tracing_subscriber::registry().with(env_filter);
    match format {
        LogFormat::Text => registry
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(verbosity >= 3),
            )
            .init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
    }
}
