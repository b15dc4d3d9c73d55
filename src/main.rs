use anyhow::{Context, Result};
use clap::Parser;
use dirpoll::config::{Cli, Settings};
use dirpoll::poller::{dispatch_channel, DispatchReceiver, DISPATCH_CHANNEL_SIZE};
use dirpoll::source::{ClientPool, LocalConnector, PooledSource};
use dirpoll::{DispatchConfirmer, LocalStore, PollingSource};
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let settings = Settings::resolve(&cli)
        .await
        .context("Invalid configuration")?;
    let store = LocalStore::open(&settings.working_dir)
        .await
        .with_context(|| {
            format!(
                "Failed to open working directory {}",
                settings.working_dir.display()
            )
        })?;

    let source = Arc::new(PooledSource::new(ClientPool::new(
        LocalConnector::new(&settings.source_dir),
        settings.max_connections,
    )));
    let (sink, rx) = dispatch_channel(DISPATCH_CHANNEL_SIZE);
    let poller = PollingSource::new(
        settings.poller.clone(),
        source.clone(),
        source.clone(),
        Arc::new(sink),
    );

    if settings.once {
        run_once(poller, rx, store).await
    } else {
        run_continuous(poller, rx, store, source).await
    }
}

/// Single cycle: poll, store whatever was dispatched, confirm, print a report
async fn run_once(
    poller: PollingSource,
    mut rx: DispatchReceiver,
    store: LocalStore,
) -> Result<()> {
    let report = poller.poll().await.context("Poll cycle failed")?;

    let mut stored = Vec::new();
    if let Ok(unit) = rx.try_recv() {
        stored = store
            .store(&unit)
            .await
            .context("Failed to store dispatched files")?;
        poller.confirmer().confirm_unit(&unit);
    }

    let output = serde_json::json!({
        "report": report,
        "stored": stored,
        "backlog": poller.state(),
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn run_continuous(
    poller: PollingSource,
    rx: DispatchReceiver,
    store: LocalStore,
    source: Arc<PooledSource<LocalConnector>>,
) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received Ctrl-C, shutting down");
        }
        let _ = shutdown_tx.send(true);
    });

    let consumer = tokio::spawn(consume(rx, store, poller.confirmer()));

    let stats = poller.run(shutdown_rx).await;
    // Closes the dispatch channel so the consumer drains and exits
    drop(poller);
    source.pool().close();

    consumer.await.context("Consumer task panicked")?;
    tracing::info!(
        "Done: {} files dispatched, {} requeued, {} bytes",
        stats.files_dispatched,
        stats.files_requeued,
        stats.bytes_dispatched
    );
    Ok(())
}

/// Store each unit and confirm it. A unit that cannot be stored is left
/// unconfirmed, so its entries stay in flight.
async fn consume(mut rx: DispatchReceiver, store: LocalStore, confirmer: DispatchConfirmer) {
    while let Some(unit) = rx.recv().await {
        match store.store(&unit).await {
            Ok(paths) => {
                let released = confirmer.confirm_unit(&unit);
                tracing::info!(
                    "Stored {} files in {} ({} confirmed)",
                    paths.len(),
                    store.dir().display(),
                    released
                );
            }
            Err(e) => {
                tracing::error!(
                    "Failed to store unit of {} files, leaving them in flight: {}",
                    unit.len(),
                    e
                );
            }
        }
    }
}
