use anyhow::Result;
use clap::{Parser, Subcommand};
use roxoe_backup::application::*;
use roxoe_backup::Config;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "roxoe-backup")]
#[command(about = "Backup and restore the Roxoe point-of-sale databases")]
#[command(version)]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true, env = "ROXOE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Export every database into a .roxoe backup
    Create {
        /// Backup file to write (defaults to a timestamped file in the backup directory)
        #[arg(long, short)]
        output: Option<PathBuf>,
        #[arg(long, short)]
        description: Option<String>,
        /// Label the backup as incremental
        #[arg(long)]
        incremental: bool,
        /// Store the payload uncompressed
        #[arg(long)]
        raw: bool,
    },
    /// Import a backup into the local databases
    Restore {
        path: PathBuf,
        /// Empty each store before importing
        #[arg(long)]
        clear_existing: bool,
    },
    /// Print a backup's metadata header
    Inspect { path: PathBuf },
    /// Check a backup's integrity and record counts
    Verify { path: PathBuf },
    /// List created backups
    History {
        /// Forget all recorded backups
        #[arg(long)]
        clear: bool,
    },
    /// Delete every record of one database, or of all of them
    Clear {
        #[arg(long)]
        database: Option<String>,
        /// Confirm the deletion
        #[arg(long)]
        yes: bool,
    },
    /// Show per-store record counts
    Stats,
    /// Generate a configuration file
    InitConfig {
        #[arg(long, short)]
        output: Option<PathBuf>,
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|format| format.eq_ignore_ascii_case("json"));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref())?;
    init_tracing(&config.operational.log_level);

    let command = match cli.command {
        Commands::InitConfig { output, force } => {
            return ConfigCommandHandler::new(config)
                .init_config(output, force)
                .await;
        }
        command => command,
    };

    let app = Application::new(config)?;
    app.initialize().await?;

    let result = run(command, &app).await;
    app.shutdown().await;
    result
}

async fn run(command: Commands, app: &Application) -> Result<()> {
    let backups = BackupCommandHandler::new(app.container.clone());
    let databases = DatabaseCommandHandler::new(app.container.clone());

    match command {
        Commands::Create {
            output,
            description,
            incremental,
            raw,
        } => backups.create(output, description, incremental, raw).await,
        Commands::Restore {
            path,
            clear_existing,
        } => backups.restore(path, clear_existing).await,
        Commands::Inspect { path } => backups.inspect(&path).await,
        Commands::Verify { path } => backups.verify(&path).await,
        Commands::History { clear } => backups.history(clear).await,
        Commands::Clear { database, yes } => databases.clear(database, yes).await,
        Commands::Stats => databases.stats().await,
        Commands::InitConfig { .. } => Ok(()),
    }
}
