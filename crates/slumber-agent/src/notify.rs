use std::time::Duration;

use anyhow::Context;
use tokio::task::JoinHandle;

use crate::config::NtfyConfig;
use crate::support::{format_error_chain, http_client};

const TITLE: &str = "Terraria Sleeping Server";
const DEFAULT_PRIORITY: u8 = 3;
const PUSH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notice {
    Starting,
    StartFailed,
    IdleShutdown,
}

impl Notice {
    pub fn message(self) -> &'static str {
        match self {
            Notice::Starting => "Terraria server is starting",
            Notice::StartFailed => "Terraria server failed to start",
            Notice::IdleShutdown => "Terraria server is shutting down (idle)",
        }
    }

    /// ntfy emoji shortcode.
    pub fn tag(self) -> &'static str {
        match self {
            Notice::Starting => "arrows_clockwise",
            Notice::StartFailed => "face_with_thermometer",
            Notice::IdleShutdown => "stop_sign",
        }
    }

    pub fn priority(self) -> u8 {
        match self {
            Notice::StartFailed => 4,
            _ => DEFAULT_PRIORITY,
        }
    }
}

/// Best-effort push notifications to an ntfy topic.
#[derive(Debug, Clone, Default)]
pub struct Notifier {
    cfg: NtfyConfig,
}

impl Notifier {
    pub fn new(cfg: NtfyConfig) -> Self {
        Self { cfg }
    }

    pub fn is_enabled(&self) -> bool {
        self.cfg.topic.is_some()
    }

    /// Fire-and-forget. Failures are logged and dropped.
    pub fn send(&self, notice: Notice) -> Option<JoinHandle<()>> {
        if !self.is_enabled() {
            return None;
        }
        let this = self.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = this.deliver(notice).await {
                tracing::warn!(
                    tag = notice.tag(),
                    error = %format_error_chain(&e),
                    "ntfy send failed"
                );
            }
        }))
    }

    pub async fn deliver(&self, notice: Notice) -> anyhow::Result<()> {
        let Some(topic) = self.cfg.topic.as_deref() else {
            return Ok(());
        };

        let mut req = http_client()
            .post(topic)
            .timeout(PUSH_TIMEOUT)
            .header("Title", TITLE)
            .header("Tags", notice.tag())
            .header("Priority", notice.priority().to_string())
            .body(notice.message());
        if let Some(token) = self.cfg.auth.as_deref() {
            req = req.bearer_auth(token);
        }

        req.send()
            .await
            .context("post ntfy notification")?
            .error_for_status()
            .context("post ntfy notification (status)")?;
        tracing::debug!(tag = notice.tag(), "ntfy notification sent");
        Ok(())
    }
}
