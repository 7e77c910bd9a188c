mod cli;
mod commands;
mod config;

use std::process;

use clap::Parser;
use cli::{Cli, Commands};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

fn main() {
    let cli = Cli::parse();

    // stderr by default; --log-file redirects. The guard must outlive all
    // logging, so it is held until exit.
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.global.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _appender_guard = match &cli.global.log_file {
        Some(log_file) => {
            let dir = log_file.parent().unwrap_or(std::path::Path::new("."));
            let file_name = log_file
                .file_name()
                .map(|n| n.to_os_string())
                .unwrap_or_else(|| "strata.log".into());
            let appender = tracing_appender::rolling::never(dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
            None
        }
    };

    let result = match cli.command {
        Commands::InitStore(args) => commands::init_store::execute(args, &cli.global),
        Commands::Create(args) => commands::create::execute(args, &cli.global),
        Commands::Delete(args) => commands::delete::execute(args, &cli.global),
        Commands::Stats(args) => commands::stats::execute(args, &cli.global),
        Commands::Clean(args) => commands::clean::execute(args, &cli.global),
        Commands::DeleteStore(args) => commands::delete_store::execute(args, &cli.global),
        Commands::Unpack(args) => commands::unpack::execute(args),
    };

    if let Err(error) = result {
        eprintln!("Error: {}", error);
        process::exit(1);
    }
}
