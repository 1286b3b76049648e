use std::{path::PathBuf, process::ExitCode, sync::Arc};

use clap::Parser;
use dbcleanup::{
    CleanupConfig, CleanupOptions, DbPool, observability,
    retention::{TableRegistry, start_cleanup_worker},
    run_cleanup,
};

/// CLI arguments for dbcleanup
#[derive(Parser, Debug)]
#[command(
    version,
    about = "Export old metadata rows to archive storage, then purge them",
    long_about = None
)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Path to config file
    #[arg(short, long, global = true, env = "DBCLEANUP_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Run one cleanup pass and print the report as JSON
    Run(RunArgs),
    /// List the tables a run would visit, in purge order
    Tables,
    /// Run the configured schedule until interrupted
    Worker,
    /// Show enabled compile-time features
    Features,
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Age in days; rows strictly older are candidates
    #[arg(long, allow_negative_numbers = true)]
    older_than: Option<i64>,

    /// Report what would be deleted without exporting or deleting (default: true)
    #[arg(long)]
    dry_run: Option<bool>,

    /// Purge only tables whose artifact was uploaded (default: false)
    #[arg(long)]
    purge_table: Option<bool>,

    /// Export format (csv)
    #[arg(long)]
    export_format: Option<String>,

    /// Staging directory for exported files (default: /tmp)
    #[arg(long)]
    output_path: Option<PathBuf>,

    /// Archive provider: local, aws, gcp or azure
    #[arg(long)]
    provider: Option<String>,

    /// Named connection from the config file
    #[arg(long)]
    connection_id: Option<String>,

    /// Environment variable holding the connection as JSON
    #[arg(long)]
    provider_env_secret_name: Option<String>,

    /// Bucket or container name
    #[arg(long)]
    bucket_name: Option<String>,

    /// Prefix for archive keys
    #[arg(long)]
    deployment_name: Option<String>,

    /// Restrict the run to these tables
    #[arg(long, value_delimiter = ',')]
    table_names: Option<Vec<String>>,

    /// Raw run option as KEY=VALUE, as a trigger would pass it. Flags win.
    #[arg(short = 'o', long = "option", value_parser = parse_key_value)]
    options: Vec<(String, String)>,
}

impl RunArgs {
    fn into_options(self) -> Result<CleanupOptions, dbcleanup::CleanupError> {
        let mut options = CleanupOptions::from_pairs(self.options)?;

        if self.older_than.is_some() {
            options.older_than = self.older_than;
        }
        if self.dry_run.is_some() {
            options.dry_run = self.dry_run;
        }
        if self.purge_table.is_some() {
            options.purge_table = self.purge_table;
        }
        if self.table_names.is_some() {
            options.table_names = self.table_names;
        }
        if self.output_path.is_some() {
            options.output_path = self.output_path;
        }
        for (slot, value) in [
            (&mut options.export_format, self.export_format),
            (&mut options.provider, self.provider),
            (&mut options.connection_id, self.connection_id),
            (&mut options.provider_env_secret_name, self.provider_env_secret_name),
            (&mut options.bucket_name, self.bucket_name),
            (&mut options.deployment_name, self.deployment_name),
        ] {
            if value.is_some() {
                *slot = value;
            }
        }

        Ok(options)
    }
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got '{raw}'"))
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    match args.command {
        Command::Run(run_args) => run_once(args.config.as_deref(), run_args).await,
        Command::Tables => run_tables(args.config.as_deref()),
        Command::Worker => run_worker(args.config.as_deref()).await,
        Command::Features => {
            run_features();
            ExitCode::SUCCESS
        }
    }
}

fn load_config(path: Option<&std::path::Path>) -> Result<CleanupConfig, ExitCode> {
    let Some(path) = path else {
        return Ok(CleanupConfig::default());
    };
    CleanupConfig::from_file(path).map_err(|e| {
        eprintln!("Failed to load config from {}: {}", path.display(), e);
        ExitCode::from(2)
    })
}

/// Load config, install logging and connect to the metadata database.
async fn bootstrap(path: Option<&std::path::Path>) -> Result<(CleanupConfig, DbPool), ExitCode> {
    let config = load_config(path)?;

    if let Err(e) = observability::init_tracing(&config.observability) {
        eprintln!("{e}");
        return Err(ExitCode::from(2));
    }

    if config.database.is_none() {
        eprintln!("Error: Database is not configured. Add a [database] section to the config.");
        return Err(ExitCode::from(2));
    }

    match DbPool::from_config(&config.database).await {
        Ok(db) => Ok((config, db)),
        Err(e) => {
            tracing::error!(error = %e, "Failed to connect to database");
            eprintln!("Error: Failed to connect to database: {e}");
            Err(ExitCode::from(2))
        }
    }
}

async fn run_once(config_path: Option<&std::path::Path>, run_args: RunArgs) -> ExitCode {
    let options = match run_args.into_options() {
        Ok(options) => options,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::from(2);
        }
    };
    let (config, db) = match bootstrap(config_path).await {
        Ok(ready) => ready,
        Err(code) => return code,
    };

    let result = run_cleanup(&db, &config, &options).await;
    db.close().await;

    match result {
        Ok(report) => {
            match serde_json::to_string_pretty(&report) {
                Ok(json) => println!("{json}"),
                Err(e) => tracing::error!(error = %e, "Failed to serialize run report"),
            }
            if report.is_success() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            tracing::error!(error = %e, kind = e.kind(), "Cleanup run rejected");
            eprintln!("Error: {e}");
            ExitCode::from(2)
        }
    }
}

fn run_tables(config_path: Option<&std::path::Path>) -> ExitCode {
    let config = match load_config(config_path) {
        Ok(config) => config,
        Err(code) => return code,
    };
    let registry = match TableRegistry::from_config(&config.retention) {
        Ok(registry) => registry,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::from(2);
        }
    };

    println!("{:<4} {:<20} {:<18} {:<36} REFERENCED BY", "RANK", "TABLE", "TIMESTAMP", "KEY");
    for table in registry.tables() {
        println!(
            "{:<4} {:<20} {:<18} {:<36} {}",
            table.rank,
            table.name,
            table.timestamp_column,
            table.key_columns.join(","),
            table.referenced_by.join(", ")
        );
    }
    ExitCode::SUCCESS
}

async fn run_worker(config_path: Option<&std::path::Path>) -> ExitCode {
    let (config, db) = match bootstrap(config_path).await {
        Ok(ready) => ready,
        Err(code) => return code,
    };
    if !config.retention.schedule.enabled {
        eprintln!("Error: retention.schedule.enabled is false. Nothing to run.");
        return ExitCode::from(2);
    }

    let db = Arc::new(db);
    let mut worker = tokio::spawn(start_cleanup_worker(
        Arc::clone(&db),
        Arc::new(config),
    ));

    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("Shutdown signal received, stopping cleanup worker");
            worker.abort();
        }
        result = &mut worker => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Cleanup worker task failed");
            }
        }
    }

    db.close().await;
    ExitCode::SUCCESS
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn run_features() {
    let version = env!("CARGO_PKG_VERSION");

    let features: &[(&str, &str, bool)] = &[
        (
            "database-sqlite",
            "Databases",
            cfg!(feature = "database-sqlite"),
        ),
        (
            "database-postgres",
            "Databases",
            cfg!(feature = "database-postgres"),
        ),
        ("s3-storage", "Archive Storage", cfg!(feature = "s3-storage")),
        ("gcs-storage", "Archive Storage", cfg!(feature = "gcs-storage")),
        (
            "azure-storage",
            "Archive Storage",
            cfg!(feature = "azure-storage"),
        ),
    ];

    let profile = if cfg!(feature = "full") {
        "full"
    } else if cfg!(feature = "standard") {
        "standard"
    } else if cfg!(feature = "minimal") {
        "minimal"
    } else {
        "custom"
    };

    println!("dbcleanup v{version}");
    println!("Build profile: {profile}");
    println!();

    let mut current_category = "";
    for (name, category, enabled) in features {
        if *category != current_category {
            if !current_category.is_empty() {
                println!();
            }
            println!("{category}:");
            current_category = category;
        }
        let marker = if *enabled { "+" } else { "-" };
        println!("  {marker} {name}");
    }

    println!();
    println!("Local archive storage is always available.");
}
