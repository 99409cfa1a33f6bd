//! DeepRead: research paper reading server.

use std::path::PathBuf;
use std::sync::Arc;

use deepread_core::DeepReadConfig;
use deepread_runtime::{BatchOptions, Event, Orchestrator, Workflow};
use deepread_server::{build_router, AppState};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn resolve_data_dir() -> PathBuf {
    std::env::var("DEEPREAD_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("data"))
}

fn print_help() {
    println!("DeepRead: research paper reading server");
    println!();
    println!("Usage: deepread [command]");
    println!();
    println!("Commands:");
    println!("  serve                       Start the server (default)");
    println!("  batch <workflow> <pdf...>   Process local PDFs and print batch statistics");
    println!("  help                        Show this help message");
    println!();
    println!("Workflows: {}", Workflow::ALL.map(|w| w.as_str()).join(", "));
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();

    match args.get(1).map(String::as_str) {
        None | Some("serve") => serve().await,
        Some("batch") => batch(&args[2..]).await,
        Some("--help") | Some("-h") | Some("help") => {
            print_help();
            Ok(())
        }
        Some(other) => {
            eprintln!("Unknown command: {}. Use 'deepread help' for usage.", other);
            std::process::exit(1);
        }
    }
}

fn load_config() -> anyhow::Result<DeepReadConfig> {
    let data_dir = resolve_data_dir();
    info!("Data directory: {}", data_dir.display());
    Ok(DeepReadConfig::from_env(&data_dir)?)
}

async fn serve() -> anyhow::Result<()> {
    let config = load_config()?;
    let addr = config.bind_addr();

    let orchestrator = Arc::new(Orchestrator::with_llm(config));
    let state = Arc::new(AppState::new(orchestrator));
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("DeepRead server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

async fn batch(args: &[String]) -> anyhow::Result<()> {
    if args.len() < 2 {
        eprintln!("Usage: deepread batch <workflow> <pdf...>");
        std::process::exit(1);
    }
    let workflow: Workflow = args[0].parse()?;
    let paths: Vec<PathBuf> = args[1..].iter().map(PathBuf::from).collect();

    let orchestrator = Orchestrator::with_llm(load_config()?);
    let options = BatchOptions {
        progress_callback: Some(Arc::new(|event: &Event| {
            if let Event::BatchProgress {
                processed,
                total,
                current_batch,
                total_batches,
                ..
            } = event
            {
                info!(
                    "Batch {}/{}: {}/{} files processed",
                    current_batch, total_batches, processed, total
                );
            }
        })),
        ..BatchOptions::default()
    };

    let report = orchestrator.batch_files(paths, workflow, options).await;
    for invalid in &report.invalid {
        eprintln!("Skipped {}: {}", invalid.path, invalid.reason);
    }
    println!("{}", serde_json::to_string_pretty(&report.stats)?);

    if report.stats.failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}
