//! Scraper worker
//!
//! Periodically spawns the stats command, parses its output, and hands
//! snapshots to the archiver through the bounded queue. Each scrape runs as
//! its own task so a slow command never delays the tick loop.

use std::process::Stdio;
use std::sync::Arc;

use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};

use crate::core::config::ScraperConfig;

use super::snapshot::{StatsSnapshot, parse_snapshot};
use super::stats::ScraperStats;

pub struct Scraper {
    config: ScraperConfig,
    queue: mpsc::Sender<StatsSnapshot>,
    stats: Arc<ScraperStats>,
}

impl Scraper {
    pub fn new(
        config: ScraperConfig,
        queue: mpsc::Sender<StatsSnapshot>,
        stats: Arc<ScraperStats>,
    ) -> Self {
        Self {
            config,
            queue,
            stats,
        }
    }

    /// Run the tick loop until shutdown. The first tick fires immediately,
    /// which doubles as the initial scrape.
    pub fn start(self, mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut inflight = JoinSet::new();
            let mut ticker = tokio::time::interval(self.config.period());

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        // Reap finished scrapes so the set does not grow.
                        while inflight.try_join_next().is_some() {}

                        inflight.spawn(scrape(
                            self.config.clone(),
                            self.queue.clone(),
                            Arc::clone(&self.stats),
                            shutdown_rx.clone(),
                        ));
                    }
                }
            }

            // Wait for in-flight scrapes before reporting the worker done.
            while inflight.join_next().await.is_some() {}
            tracing::debug!("Scraper shutdown complete");
        })
    }
}

enum ScrapeOutcome {
    Finished(std::io::Result<std::process::Output>),
    DeadlineExceeded,
    Cancelled,
}

async fn scrape(
    config: ScraperConfig,
    queue: mpsc::Sender<StatsSnapshot>,
    stats: Arc<ScraperStats>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let argv = match config.argv() {
        Ok(argv) => argv,
        Err(e) => {
            stats.execution_failed.inc();
            tracing::error!(error = %e, "Failed to build stats command!");
            return;
        }
    };

    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    // The command runs in its own process group so that cancellation can
    // reach descendants a single-pid kill would miss.
    #[cfg(unix)]
    cmd.process_group(0);

    let child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            stats.execution_failed.inc();
            tracing::error!(error = %e, command = %argv[0], "Failed to spawn stats command!");
            return;
        }
    };
    let pid = child.id();

    // The deadline is the scraper period, not the scraper timeout: a late
    // scrape must never overlap the next tick.
    let deadline = config.period();
    let output_fut = child.wait_with_output();
    tokio::pin!(output_fut);

    let outcome = tokio::select! {
        biased;
        _ = shutdown_rx.wait_for(|&stop| stop) => ScrapeOutcome::Cancelled,
        result = tokio::time::timeout(deadline, &mut output_fut) => match result {
            Ok(output) => ScrapeOutcome::Finished(output),
            Err(_) => ScrapeOutcome::DeadlineExceeded,
        },
    };

    match outcome {
        ScrapeOutcome::Finished(Ok(output)) => {
            let mut combined = output.stdout;
            combined.extend_from_slice(&output.stderr);

            if !output.status.success() {
                stats.execution_failed.inc();
                tracing::error!(
                    status = %output.status,
                    output = %String::from_utf8_lossy(&combined),
                    "Failed to execute stats command!"
                );
                return;
            }

            match parse_snapshot(&combined) {
                Ok(snapshot) => {
                    stats.execution_completed.inc();
                    tracing::debug!(
                        version = snapshot.version,
                        items = snapshot.items.len(),
                        "Successfully fetched stats command output"
                    );

                    // Never block on a full queue: insertions into storage
                    // may be slow and a backlog of scrape tasks would pile
                    // up behind it.
                    match queue.try_send(snapshot) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            stats.queuing_failed.inc();
                            tracing::error!("Snapshot queue is full, dropping snapshot!");
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => {
                            // Receiver gone during shutdown: silent drop.
                        }
                    }
                }
                Err(e) => {
                    stats.execution_failed.inc();
                    tracing::error!(
                        error = %e,
                        output = %String::from_utf8_lossy(&combined),
                        "Failed to parse stats command output!"
                    );
                }
            }
        }
        ScrapeOutcome::Finished(Err(e)) => {
            stats.execution_failed.inc();
            tracing::error!(error = %e, "Failed to execute stats command!");
        }
        ScrapeOutcome::DeadlineExceeded => {
            kill_process_group(pid);
            stats.execution_failed.inc();
            tracing::error!(
                timeout_secs = deadline.as_secs(),
                "Stats command execution timed out!"
            );
        }
        ScrapeOutcome::Cancelled => {
            kill_process_group(pid);
            stats.execution_failed.inc();
            tracing::debug!("Stats command cancelled during shutdown");
        }
    }
}

/// Kill the child's whole process group. The child may have forked
/// descendants that a single-pid kill would leave running.
fn kill_process_group(pid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        unsafe {
            libc::kill(-(pid as i32), libc::SIGKILL);
        }
    }
    #[cfg(not(unix))]
    let _ = pid;
}
