use std::path::PathBuf;

use tokio_util::sync::CancellationToken;

mod config;
mod input;
mod words;

use config::OutputFormat;
use words::WordCount;

fn init_logging() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Warn)
        .filter_module("conveyor", log::LevelFilter::Info)
        .filter_module("conveyor_core", log::LevelFilter::Info)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let config = config::config();
    let paths: Vec<PathBuf> = std::env::args_os().skip(1).map(PathBuf::from).collect();

    let shutdown = CancellationToken::new();
    let pipeline = words::build_pipeline(config.pipeline(), &shutdown)?;
    let input = input::open_input(&paths).await;
    let results = pipeline.start(input)?;

    let shutdown_clone = shutdown.clone();
    let signals = tokio::spawn(async move {
        tokio::select! {
            _ = shutdown_clone.cancelled() => {},
            _ = tokio::signal::ctrl_c() => {
                log::info!("ctrl-c received, shutting down");
                shutdown_clone.cancel();
            },
        }
    });

    let count = WordCount::collect(results).await;
    let exit = pipeline
        .await_done(Some(config.force_timeout()))
        .await;
    shutdown.cancel();
    let _ = signals.await;

    let report = count.report(config.top(), &exit);
    match config.format() {
        OutputFormat::Text => print!("{}", report.to_text()),
        OutputFormat::Json => println!("{}", report.to_json()?),
    }

    if !exit.is_completed() {
        std::process::exit(1);
    }
    Ok(())
}
