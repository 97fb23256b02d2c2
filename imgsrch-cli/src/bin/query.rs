use clap::Parser;
use imgsrch_cli::open_library;
use imgsrch_core::{app_config::AppConfig, search::RequestContext};

#[derive(Parser, Debug)]
#[command(name = "imgsrch-query")]
#[command(version = "0.1")]
#[command(about = "searches the local image index with a text query", long_about = None)]
struct Args {
    /// Free text describing the image
    query: String,
    /// Number of results, defaults to the configured value
    #[arg(short, long)]
    num_results: Option<usize>,
    /// Prefix for the printed result URLs
    #[arg(long, default_value = "")]
    base_url: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let config = AppConfig::load()?;
    let library = open_library(&config).await?;
    let top_k = args.num_results.unwrap_or(config.default_top_k);

    println!("Querying index at {} with query: \"{}\"", config.data_directory, args.query);
    let results = library.search(&args.query, top_k, &RequestContext::new(args.base_url)).await?;

    if results.is_empty() {
        println!("No results!");
    } else {
        println!("Results ({}):", results.len());
        for (i, result) in results.iter().enumerate() {
            println!("{}: {} ({:.4}) {}", i + 1, result.path, result.score, result.display_url);
        }
    }

    Ok(())
}
