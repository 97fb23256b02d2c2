use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use imgsrch_cli::open_store;
use imgsrch_core::{app_config::AppConfig, store::drop_table};

#[derive(Parser, Debug)]
#[command(name = "imgsrch-db")]
#[command(version = "0.1")]
#[command(about = "inspects and maintains the local image index", long_about = None)]
struct Args {
    /// Directory where the index is stored, defaults to the configured one
    #[arg(long)]
    data_directory: Option<Utf8PathBuf>,
    /// Table holding the embeddings, defaults to the configured one
    #[arg(long)]
    table_name: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print record counts and storage size
    Stats {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Remove records of files that no longer exist
    Cleanup,
    /// Remove every record
    Clear,
    /// Drop the whole table (development use)
    Drop,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut config = AppConfig::load()?;
    if let Some(dir) = args.data_directory {
        config.data_directory = dir;
    }
    if let Some(table) = args.table_name {
        config.table_name = table;
    }

    match args.command {
        Command::Stats { json } => {
            let stats = open_store(&config).await?.stats().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("Database: {}", stats.database_path);
                println!("Total embeddings: {}", stats.total_embeddings);
                println!("Added in the last 24h: {}", stats.recent_embeddings);
                println!("Size: {:.2} MB", stats.database_size_mb);
            }
        },
        Command::Cleanup => {
            let removed = open_store(&config).await?.cleanup_missing().await?;
            println!("Removed {} records of missing files", removed);
        },
        Command::Clear => {
            open_store(&config).await?.clear().await?;
            println!("Cleared all records from {}", config.table_name);
        },
        Command::Drop => {
            drop_table(&config.data_directory, &config.table_name).await?;
            println!("Completed dropping lancedb table at {}, {}", config.data_directory, config.table_name);
        },
    }

    Ok(())
}
