use std::fs::File;
use std::io::BufReader;

use pgtrace::capture::{CaptureDriver, CaptureError};
use pgtrace::config::TraceConfig;
use pgtrace::store::{channel, SqliteStore};
use pgtrace::tracer::{IdleTimeout, MaxConnections, Tracer};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("pgtrace=info".parse().unwrap()))
        .init();

    let config = TraceConfig::from_env().expect("Invalid configuration");

    println!("pgtrace - passive PostgreSQL query tracer");
    println!("Capture: {}", config.capture.display());
    println!("Server port: {}", config.server_port);
    println!("Database: {}", config.db_path);

    let store = SqliteStore::open(&config.db_path).expect("Failed to open database");
    let (sender, worker) = channel::channel(store, config.channel_capacity);
    let persist = tokio::spawn(worker.run());

    let file = File::open(&config.capture).expect("Failed to open capture file");
    let replay = tokio::task::spawn_blocking(move || {
        let mut tracer = Tracer::new(sender).with_response_mode(config.response_mode);
        tracer = match (config.idle_timeout, config.max_connections) {
            (Some(timeout), Some(max)) => tracer.with_eviction((IdleTimeout::new(timeout), MaxConnections::new(max))),
            (Some(timeout), None) => tracer.with_eviction(IdleTimeout::new(timeout)),
            (None, Some(max)) => tracer.with_eviction(MaxConnections::new(max)),
            (None, None) => tracer,
        };
        let mut driver = CaptureDriver::new(tracer, config.server_port);
        match driver.replay(BufReader::new(file)) {
            // tcpdump killed mid-write leaves a partial last record.
            Err(CaptureError::Truncated { packets, trailing }) => {
                tracing::warn!("capture ends inside a record after {} packets, {} bytes ignored", packets, trailing);
                Ok(driver.stats().clone())
            }
            result => result,
        }
    });

    let stats = replay.await.expect("Replay task panicked").expect("Capture error");
    let (_store, persisted) = persist.await.expect("Persistence task panicked");

    println!(
        "Packets: {} ({} TCP), statements: {}, completed: {} ({} errors)",
        stats.packets, stats.decoded, stats.statements, stats.completed, stats.failed
    );
    println!(
        "Stored: {} queries, {} parameter sets, {} finished, {} abandoned, {} failures",
        persisted.created, persisted.parameter_sets, persisted.finished, persisted.discarded, persisted.failures
    );
}
