//! `bleepstore-meta`: metadata export/import tool.
//!
//! Resolves the metadata backend from the same YAML config as the
//! engine, so it works against any configured substrate, not just the
//! local ones.  Exit code 0 on success, 1 on I/O or validation
//! failure.

use std::io::Read;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

use bleepstore::serialization::{
    export_state, import_state, ExportOptions, ImportOptions, ALL_TABLES,
};

#[derive(Parser)]
#[command(name = "bleepstore-meta", about = "BleepStore metadata export/import tool")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Export metadata to JSON
    Export {
        /// Path to the YAML configuration file.
        #[arg(long, default_value = "bleepstore.yaml")]
        config: PathBuf,
        /// Output format (only `json`).
        #[arg(long, default_value = "json")]
        format: String,
        /// Output path; `-` writes to stdout.
        #[arg(long, default_value = "-")]
        output: String,
        /// Comma-separated table subset.
        #[arg(long)]
        tables: Option<String>,
        /// Emit real secret keys instead of REDACTED.
        #[arg(long, default_value_t = false)]
        include_credentials: bool,
    },
    /// Import metadata from JSON
    Import {
        /// Path to the YAML configuration file.
        #[arg(long, default_value = "bleepstore.yaml")]
        config: PathBuf,
        /// Input path; `-` reads stdin.
        #[arg(long, default_value = "-")]
        input: String,
        /// Merge mode: insert only missing rows (default).
        #[arg(long, default_value_t = false, conflicts_with = "replace")]
        merge: bool,
        /// Replace mode: truncate the tables present in the input
        /// first.
        #[arg(long, default_value_t = false)]
        replace: bool,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let code = match cli.command {
        Commands::Export {
            config,
            format,
            output,
            tables,
            include_credentials,
        } => run_export(config, format, output, tables, include_credentials).await,
        Commands::Import {
            config,
            input,
            merge: _,
            replace,
        } => run_import(config, input, replace).await,
    };
    std::process::exit(code);
}

async fn open_store(
    config_path: &PathBuf,
) -> Result<std::sync::Arc<dyn bleepstore::metadata::store::MetadataStore>, String> {
    let config = bleepstore::config::load_config(config_path)
        .map_err(|e| format!("reading config {}: {e}", config_path.display()))?;
    bleepstore::open_metadata_store(&config)
        .await
        .map_err(|e| format!("opening metadata store: {e}"))
}

async fn run_export(
    config: PathBuf,
    format: String,
    output: String,
    tables: Option<String>,
    include_credentials: bool,
) -> i32 {
    if format != "json" {
        eprintln!("Error: unsupported format: {format}");
        return 1;
    }

    let table_list: Vec<String> = match tables {
        Some(csv) => {
            let list: Vec<String> = csv.split(',').map(|s| s.trim().to_string()).collect();
            for name in &list {
                if !ALL_TABLES.contains(&name.as_str()) {
                    eprintln!("Error: invalid table name: {name}");
                    return 1;
                }
            }
            list
        }
        None => ALL_TABLES.iter().map(|s| s.to_string()).collect(),
    };

    let store = match open_store(&config).await {
        Ok(store) => store,
        Err(message) => {
            eprintln!("Error: {message}");
            return 1;
        }
    };

    let options = ExportOptions {
        tables: table_list,
        include_credentials,
    };
    match export_state(store.as_ref(), &options).await {
        Ok(rendered) => {
            if output == "-" {
                println!("{rendered}");
            } else {
                if let Err(e) = std::fs::write(&output, format!("{rendered}\n")) {
                    eprintln!("Error writing output: {e}");
                    return 1;
                }
                eprintln!("Exported to {output}");
            }
            0
        }
        Err(e) => {
            eprintln!("Error exporting: {e}");
            1
        }
    }
}

async fn run_import(config: PathBuf, input: String, replace: bool) -> i32 {
    let json_str = if input == "-" {
        let mut buffer = String::new();
        if let Err(e) = std::io::stdin().read_to_string(&mut buffer) {
            eprintln!("Error reading stdin: {e}");
            return 1;
        }
        buffer
    } else {
        match std::fs::read_to_string(&input) {
            Ok(contents) => contents,
            Err(e) => {
                eprintln!("Error reading input: {e}");
                return 1;
            }
        }
    };

    let store = match open_store(&config).await {
        Ok(store) => store,
        Err(message) => {
            eprintln!("Error: {message}");
            return 1;
        }
    };

    match import_state(store.as_ref(), &json_str, &ImportOptions { replace }).await {
        Ok(report) => {
            for table in ALL_TABLES {
                if let Some(count) = report.counts.get(*table) {
                    let skipped = report.skipped.get(*table).copied().unwrap_or(0);
                    let mut line = format!("  {table}: {count} imported");
                    if skipped > 0 {
                        line.push_str(&format!(", {skipped} skipped"));
                    }
                    eprintln!("{line}");
                }
            }
            for warning in &report.warnings {
                eprintln!("  WARNING: {warning}");
            }
            0
        }
        Err(e) => {
            eprintln!("Error importing: {e}");
            1
        }
    }
}
