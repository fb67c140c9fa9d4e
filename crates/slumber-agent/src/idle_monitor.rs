use std::time::Duration;

use anyhow::Context;
use slumber_process::RunId;
use tokio::{
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};

use crate::events::{Event, EventSender};
use crate::support::{format_error_chain, http_client};

/// Result of feeding one poll into the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Status query failed; nothing changed.
    NotReady,
    /// Players online. `reset` is true when this cleared a running idle timer.
    Busy { reset: bool },
    IdleStarted,
    Idle { elapsed: Duration },
    Expired { elapsed: Duration },
}

/// Tracks how long the server has continuously reported zero players.
#[derive(Debug, Default)]
pub struct IdleTracker {
    idle_since: Option<Instant>,
}

impl IdleTracker {
    #[cfg(test)]
    pub fn idle_since(&self) -> Option<Instant> {
        self.idle_since
    }

    pub fn observe(&mut self, count: Option<u64>, now: Instant, timeout: Duration) -> PollOutcome {
        match count {
            None => PollOutcome::NotReady,
            Some(n) if n > 0 => PollOutcome::Busy {
                reset: self.idle_since.take().is_some(),
            },
            Some(_) => match self.idle_since {
                None => {
                    self.idle_since = Some(now);
                    PollOutcome::IdleStarted
                }
                Some(since) => {
                    let elapsed = now.saturating_duration_since(since);
                    if elapsed >= timeout {
                        PollOutcome::Expired { elapsed }
                    } else {
                        PollOutcome::Idle { elapsed }
                    }
                }
            },
        }
    }
}

/// Queries the real server's status API for its player count.
#[derive(Debug, Clone)]
pub struct StatusProbe {
    url: String,
    timeout: Duration,
}

impl StatusProbe {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            timeout,
        }
    }

    pub async fn client_count(&self) -> anyhow::Result<u64> {
        let body: serde_json::Value = http_client()
            .get(&self.url)
            .timeout(self.timeout)
            .send()
            .await
            .context("query server status")?
            .error_for_status()
            .context("query server status (status)")?
            .json()
            .await
            .context("decode server status")?;
        slumber_process::client_count(&body)
            .ok_or_else(|| anyhow::anyhow!("server status has no usable player count"))
    }
}

/// Periodic idle check for one awake period. Cancelled by dropping or `cancel()`.
#[derive(Debug)]
pub struct IdleMonitor {
    run: RunId,
    task: JoinHandle<()>,
}

impl IdleMonitor {
    pub fn spawn(
        run: RunId,
        probe: StatusProbe,
        period: Duration,
        timeout: Duration,
        events: EventSender,
    ) -> Self {
        tracing::info!(
            %run,
            period_ms = period.as_millis() as u64,
            timeout_ms = timeout.as_millis() as u64,
            "idle monitor started"
        );
        let task = tokio::spawn(poll_loop(run.clone(), probe, period, timeout, events));
        Self { run, task }
    }

    #[cfg(test)]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stops polling. An in-flight query is dropped with the task.
    pub fn cancel(self) {
        tracing::debug!(run = %self.run, "idle monitor cancelled");
        // Drop aborts.
    }
}

impl Drop for IdleMonitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn poll_loop(
    run: RunId,
    probe: StatusProbe,
    period: Duration,
    timeout: Duration,
    events: EventSender,
) {
    let mut tracker = IdleTracker::default();
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let count = match probe.client_count().await {
            Ok(n) => Some(n),
            Err(e) => {
                tracing::debug!(%run, error = %format_error_chain(&e), "status poll failed");
                None
            }
        };

        match tracker.observe(count, Instant::now(), timeout) {
            PollOutcome::NotReady | PollOutcome::Idle { .. } | PollOutcome::Busy { reset: false } => {}
            PollOutcome::Busy { reset: true } => {
                tracing::info!(%run, "player connected, idle timer reset");
            }
            PollOutcome::IdleStarted => {
                tracing::info!(%run, "no players online, idle timer started");
            }
            PollOutcome::Expired { elapsed } => {
                tracing::info!(
                    %run,
                    idle_ms = elapsed.as_millis() as u64,
                    "idle timeout exceeded"
                );
                let _ = events.send(Event::IdleTimeout { run });
                return;
            }
        }
    }
}
