//! Course sync demo
//!
//! Syncs one course described by a JSON manifest and prints progress until
//! every entry has settled.
//!
//! Usage: cargo run --example course_sync -- <manifest.json> <course-id> [root-dir]

use course_sync::{
    CourseId, HttpTransport, ManifestSource, SyncConfig, SyncEngine, SyncEvent,
};
use std::env;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging; RUST_LOG=course_sync=debug for details
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut args = env::args().skip(1);
    let manifest = args.next().unwrap_or_else(|| "courses.json".to_string());
    let course = CourseId::new(args.next().unwrap_or_else(|| "101".to_string()));

    let mut config = SyncConfig::default().session_id("demo");
    if let Some(root) = args.next() {
        config = config.root_dir(root);
    }

    let source = Arc::new(ManifestSource::load(&manifest).await?);
    let transport = Arc::new(HttpTransport::new(&config.http)?);
    let engine = SyncEngine::new(config, source, transport).await?;

    let report = engine.recovery_report();
    if report.requeued + report.invalidated + report.orphans_removed > 0 {
        println!("Recovered previous session: {report:?}");
    }

    // Print every visible change
    let mut events = engine.subscribe();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                SyncEvent::StatusChanged(change) => {
                    let size = change
                        .size_bytes
                        .map_or_else(|| "?".to_string(), |s| s.to_string());
                    match change.new_status {
                        Some(status) => println!(
                            "{:<40} {:<12} {}/{} bytes",
                            change.entry_id, status, change.bytes_transferred, size
                        ),
                        None => println!("{:<40} removed", change.entry_id),
                    }
                }
                SyncEvent::SyncHalted { reason } => eprintln!("Sync halted: {reason}"),
                other => println!("{other:?}"),
            }
        }
    });

    println!("Syncing course {course} from {manifest}");
    let mut job = engine.start_sync(&course).await?;
    println!("{} entries composed", job.entry_ids().len());

    tokio::select! {
        outcome = job.wait() => {
            let outcome = outcome?;
            println!(
                "Done: {} completed, {} failed, {} server errors",
                outcome.completed, outcome.failed, outcome.server_error
            );
        }
        _ = tokio::signal::ctrl_c() => {
            println!("Interrupted, pausing course");
            engine.pause_all(&course).await?;
        }
    }

    let summary = engine.summarize(&course).await?;
    println!(
        "Course {course}: {}/{} bytes on disk",
        summary.transferred_bytes, summary.total_bytes
    );

    engine.shutdown().await?;
    Ok(())
}
