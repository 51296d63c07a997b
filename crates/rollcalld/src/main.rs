use anyhow::{Context, Result};
use rollcall_core::{Config, EmbeddingGallery, EuclideanMatcher, FeedReader, PrecomputedEmbedder};
use rollcall_ledger::{AttendanceEvent, FailoverLedger, LedgerOptions};
use std::io::BufRead;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

mod engine;

use engine::{LiveCounters, LiveRecognizer};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "rollcalld starting");

    let config = Config::load().context("loading configuration")?;
    tracing::info!(
        gallery = %config.gallery_path.display(),
        tolerance = config.tolerance,
        debounce_secs = config.debounce_secs,
        stride = config.live_stride,
        group = config.group_id.as_deref().unwrap_or("-"),
        "configuration loaded"
    );

    let stride = NonZeroUsize::new(config.live_stride).context("ROLLCALL_LIVE_STRIDE must be at least 1")?;
    let gallery = Arc::new(EmbeddingGallery::load(&config.gallery_path, config.embedding_dim));
    if gallery.identity_count() == 0 {
        tracing::warn!("gallery is empty; every face will be unknown until identities are registered");
    }

    let ledger = FailoverLedger::open(LedgerOptions {
        primary_db_path: config.primary_db_path.clone(),
        fallback_path: config.fallback_path.clone(),
        backend_timeout: config.backend_timeout(),
        probe_timeout: config.probe_timeout(),
    });
    ledger.probe().await;

    let source: Box<dyn BufRead + Send> = match &config.feed_path {
        Some(path) => {
            let file = std::fs::File::open(path).with_context(|| format!("opening feed {}", path.display()))?;
            tracing::info!(path = %path.display(), "reading frame feed");
            Box::new(std::io::BufReader::new(file))
        }
        None => {
            tracing::info!("reading frame feed from stdin");
            Box::new(std::io::BufReader::new(std::io::stdin()))
        }
    };

    let (marks_tx, marks_rx) = mpsc::channel::<AttendanceEvent>(64);
    let live = engine::spawn_live_loop(
        FeedReader::new(source),
        PrecomputedEmbedder,
        LiveRecognizer::new(
            EuclideanMatcher::new(config.tolerance),
            config.debounce(),
            config.group_id.clone(),
        ),
        Arc::clone(&gallery),
        stride,
        marks_tx,
    )?;

    let mut recorder = tokio::spawn(record_marks(ledger, marks_rx, live.counters()));
    let mut hangup = signal(SignalKind::hangup())?;

    tracing::info!("rollcalld ready");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("rollcalld shutting down");
                live.stop();
                // Flush marks already queued; the feed may still be blocked on input.
                if tokio::time::timeout(config.backend_timeout() * 2, &mut recorder).await.is_err() {
                    tracing::warn!("pending attendance marks not flushed before exit");
                }
                break;
            }
            _ = hangup.recv() => {
                let stats = gallery.reload();
                tracing::info!(identities = stats.identities, embeddings = stats.embeddings, "gallery reloaded on SIGHUP");
            }
            res = &mut recorder => {
                res.context("attendance recorder task failed")?;
                tracing::info!(finished = live.is_finished(), "frame feed ended");
                break;
            }
        }
    }

    let status = live.status();
    tracing::info!(
        frames_seen = status.frames_seen,
        frames_processed = status.frames_processed,
        faces = status.faces,
        marks_accepted = status.marks_accepted,
        marks_suppressed = status.marks_suppressed,
        insert_failures = status.insert_failures,
        "rollcalld stopped"
    );
    Ok(())
}

/// Drain accepted marks into the ledger until the live thread hangs up.
async fn record_marks(
    ledger: FailoverLedger,
    mut marks: mpsc::Receiver<AttendanceEvent>,
    counters: Arc<LiveCounters>,
) {
    while let Some(event) = marks.recv().await {
        let identity = event.identity_id.clone();
        match ledger.insert(event).await {
            Ok(stored) => tracing::info!(
                identity = %identity,
                confidence = stored.record.confidence,
                backend = ?stored.backend,
                record_id = %stored.record.record_id,
                "attendance marked"
            ),
            Err(e) => {
                counters.record_insert_failure();
                tracing::error!(identity = %identity, error = %e, "attendance not recorded");
            }
        }
    }
}
