use std::path::PathBuf;

use clap::Parser;
use imgsrch_cli::{clean_path, open_library};
use imgsrch_core::{app_config::AppConfig, indexing::IndexingEvent};
use log::{error, info};

#[derive(Parser, Debug)]
#[command(name = "imgsrch-daemon")]
#[command(version = "0.1")]
#[command(about = "indexes folders, then keeps indexing new images in them until interrupted", long_about = None)]
struct Args {
    /// Print indexing events as JSON lines on stdout
    #[arg(long)]
    events: bool,
    /// Folders to index and watch
    #[arg(required = true)]
    folders: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let config = AppConfig::load()?;
    let library = open_library(&config).await?;

    let print_events = args.events;
    let sink = move |event: IndexingEvent| {
        if print_events {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{}", line),
                Err(e) => error!("Could not serialize event: {}", e),
            }
        }
    };

    for folder in args.folders {
        let folder = clean_path(folder)?;
        match library.add_folder(folder.as_str(), &sink).await {
            Ok(summary) => info!("{}: {} added, {} up to date", summary.folder, summary.added, summary.skipped),
            Err(e) => error!("Could not add {}: {}", folder, e),
        }
    }

    info!("Watching {:?}, press Ctrl-C to stop", library.watched_folders());
    tokio::signal::ctrl_c().await?;

    info!("Shutting down");
    library.shutdown().await;
    Ok(())
}
