use std::path::PathBuf;

use clap::Parser;
use imgsrch_cli::{clean_path, open_library, ProgressBarSink};
use imgsrch_core::app_config::AppConfig;

#[derive(Parser, Debug)]
#[command(name = "imgsrch-index")]
#[command(version = "0.1")]
#[command(about = "embeds every image under the given folders into the local index", long_about = None)]
struct Args {
    /// Images per inference batch, overrides the configured value
    #[arg(short, long)]
    batch_size: Option<usize>,
    /// Folders to index
    #[arg(required = true)]
    folders: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut config = AppConfig::load()?;
    if let Some(batch_size) = args.batch_size {
        config.batch_size = batch_size;
    }
    let library = open_library(&config).await?;

    let start_time = std::time::Instant::now();
    for folder in args.folders {
        let folder = clean_path(folder)?;
        let sink = ProgressBarSink::new();
        let summary = library.index_folder(folder.as_str(), &sink).await?;
        println!("{}: {} images, {} added, {} up to date, {} failed",
            summary.folder, summary.total, summary.added, summary.skipped, summary.failed);
    }

    let stats = library.stats().await?;
    println!("Index at {} now holds {} images ({:.2} MB). Took {:.2?}",
        stats.database_path, stats.total_embeddings, stats.database_size_mb, start_time.elapsed());
    Ok(())
}
