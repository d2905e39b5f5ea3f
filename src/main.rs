use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;

use migrator::config::Config;
use migrator::logging;
use migrator::pipeline::Orchestrator;
use migrator::repository::http::HttpRepository;
use migrator::repository::StepRepository;

#[derive(Parser)]
#[command(name = "migrator")]
#[command(about = "Consolidates per-tenant search indices into one versioned index")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long)]
    config: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the migration pipeline
    Run,

    /// Show the migration status document
    Status,

    /// Delete the migration status document, releasing a stuck lock
    Reset {
        /// Skip confirmation prompt
        #[arg(short = 'y', long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref())?;
    let logging_handle = logging::init_logging(&config, cli.debug)?;

    let repo: Arc<dyn StepRepository> =
        Arc::new(HttpRepository::new(&config.cluster).context("Failed to create cluster client")?);

    let exit_code = match cli.command {
        Commands::Run => cmd_run(repo, &config).await?,
        Commands::Status => cmd_status(repo.as_ref()).await?,
        Commands::Reset { yes } => cmd_reset(repo.as_ref(), yes).await?,
    };

    if let Some(ref log_path) = logging_handle.log_file_path {
        eprintln!("Log file: {}", log_path.display());
    }

    // Flush buffered file logs before exiting.
    drop(logging_handle);
    std::process::exit(exit_code);
}

async fn cmd_run(repo: Arc<dyn StepRepository>, config: &Config) -> Result<i32> {
    let orchestrator = Orchestrator::new(repo, config);
    let report = orchestrator.run().await;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(if report.succeeded() { 0 } else { 1 })
}

async fn cmd_status(repo: &dyn StepRepository) -> Result<i32> {
    match repo
        .get_status_document()
        .await
        .context("Failed to read status document")?
    {
        Some(doc) => {
            println!("{}", serde_json::to_string_pretty(&doc)?);
            Ok(0)
        }
        None => {
            println!("No migration has run against this cluster");
            Ok(0)
        }
    }
}

async fn cmd_reset(repo: &dyn StepRepository, skip_confirm: bool) -> Result<i32> {
    let Some(doc) = repo
        .get_status_document()
        .await
        .context("Failed to read status document")?
    else {
        println!("No status document to delete");
        return Ok(0);
    };

    if !skip_confirm {
        println!(
            "Delete status document for run {} (state {:?})?",
            doc.run_id, doc.state
        );
        print!("Confirm? [y/N] ");

        use std::io::{self, Write};
        io::stdout().flush()?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;

        if !input.trim().eq_ignore_ascii_case("y") {
            println!("Cancelled");
            return Ok(0);
        }
    }

    repo.delete_status_document()
        .await
        .context("Failed to delete status document")?;
    println!("Status document deleted");
    Ok(0)
}
