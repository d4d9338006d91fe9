mod cli;

use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use ralph::{commands, config};

use cli::{Cli, Command};

#[tokio::main]
async fn main() -> ExitCode {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    // clap handles usage errors itself with exit code 2
    let cli = Cli::parse();

    match dispatch(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::from(1)
        }
    }
}

async fn dispatch(cli: Cli) -> Result<u8> {
    let workspace = config::workspace_dir()?;
    let overrides = config::Overrides {
        agent: cli.agent.clone(),
        max_workers: cli.max_workers,
        port: cli.port,
        host: cli.host.clone(),
    };
    let config = config::resolve(&workspace, &overrides)?;

    match cli.command {
        Command::Serve => commands::serve::serve(workspace, config).await,
        Command::Run { iterations } => {
            commands::run::run(
                workspace,
                config,
                commands::run::RunOptions {
                    iterations,
                    json: cli.json,
                    watch: cli.watch,
                },
            )
            .await
        }
        Command::Replay { file } => {
            let stats = commands::replay::replay(&file, cli.json, &mut std::io::stdout())?;
            tracing::info!(events = stats.events, "replay complete");
            Ok(0)
        }
    }
}
