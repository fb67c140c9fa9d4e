use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::Context;
use axum::{Json, Router, extract::State, routing::get};
use slumber_process::SleepingStatus;
use tokio::{
    io::AsyncReadExt,
    net::{TcpListener, TcpStream},
    sync::oneshot,
    task::JoinHandle,
};

use crate::config::{Settings, WakePolicy};
use crate::events::{Event, EventSender};

/// Bytes of a Terraria client hello needed to recognize it: a u16 length, the
/// message type, the string length, then `Terraria<version>`.
const HELLO_PREFIX_LEN: usize = 12;
const HELLO_MAGIC: &[u8] = b"Terraria";
const HANDSHAKE_READ_TIMEOUT: Duration = Duration::from_secs(3);
const STATUS_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

pub fn is_client_hello(buf: &[u8]) -> bool {
    buf.get(4..HELLO_PREFIX_LEN) == Some(HELLO_MAGIC)
}

async fn read_client_hello(stream: &mut TcpStream) -> bool {
    let mut buf = [0u8; HELLO_PREFIX_LEN];
    match tokio::time::timeout(HANDSHAKE_READ_TIMEOUT, stream.read_exact(&mut buf)).await {
        Ok(Ok(_)) => is_client_hello(&buf),
        _ => false,
    }
}

/// Emits at most one wake event per gate lifetime.
#[derive(Clone)]
struct WakeLatch {
    fired: Arc<AtomicBool>,
    generation: u64,
    events: EventSender,
}

impl WakeLatch {
    fn fire(&self, peer: SocketAddr) {
        if self.fired.swap(true, Ordering::SeqCst) {
            tracing::debug!(%peer, "wake already requested; ignoring connection");
            return;
        }
        tracing::info!(%peer, "connection received on game port, waking server");
        let _ = self.events.send(Event::WakeRequested {
            generation: self.generation,
            peer,
        });
    }
}

async fn accept_loop(listener: TcpListener, policy: WakePolicy, latch: WakeLatch) {
    loop {
        let (mut stream, peer) = match listener.accept().await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "game port accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };

        match policy {
            WakePolicy::AnyConnection => {
                drop(stream);
                latch.fire(peer);
            }
            WakePolicy::Handshake => {
                let latch = latch.clone();
                tokio::spawn(async move {
                    let genuine = read_client_hello(&mut stream).await;
                    drop(stream);
                    if genuine {
                        latch.fire(peer);
                    } else {
                        tracing::info!(%peer, "connection on game port was not a terraria client; ignoring");
                    }
                });
            }
        }
    }
}

fn status_router(body: SleepingStatus) -> Router {
    // TShock's dashboard path, plus the path the idle monitor polls.
    Router::new()
        .route("/v2/server/status", get(sleeping_status))
        .route("/status", get(sleeping_status))
        .with_state(Arc::new(body))
}

async fn sleeping_status(State(body): State<Arc<SleepingStatus>>) -> Json<SleepingStatus> {
    Json(body.as_ref().clone())
}

/// Stand-in for the game server while it is stopped: a silent listener on the game
/// port and a fake status API on the REST port.
pub struct SleepGate {
    generation: u64,
    game_addr: SocketAddr,
    status_addr: SocketAddr,
    accept_task: JoinHandle<()>,
    status_task: JoinHandle<()>,
    status_shutdown: Option<oneshot::Sender<()>>,
}

impl SleepGate {
    /// Binds both sockets. Either bind failing is returned as an error and nothing
    /// stays bound.
    pub async fn bind(
        settings: &Settings,
        generation: u64,
        events: EventSender,
    ) -> anyhow::Result<Self> {
        let game_listener = TcpListener::bind((settings.bind_ip, settings.game_port))
            .await
            .with_context(|| format!("bind game port {}", settings.game_port))?;
        let status_listener = TcpListener::bind((settings.bind_ip, settings.rest_port))
            .await
            .with_context(|| format!("bind status port {}", settings.rest_port))?;
        let game_addr = game_listener.local_addr()?;
        let status_addr = status_listener.local_addr()?;

        let latch = WakeLatch {
            fired: Arc::new(AtomicBool::new(false)),
            generation,
            events,
        };
        let accept_task = tokio::spawn(accept_loop(game_listener, settings.wake_policy, latch));

        let app = status_router(SleepingStatus::new(
            settings.game_port,
            settings.max_players,
        ));
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let status_task = tokio::spawn(async move {
            let res = axum::serve(status_listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;
            if let Err(e) = res {
                tracing::warn!(error = %e, "sleeping status server failed");
            }
        });

        tracing::info!(
            generation,
            %game_addr,
            %status_addr,
            policy = ?settings.wake_policy,
            "sleep gate listening"
        );

        Ok(Self {
            generation,
            game_addr,
            status_addr,
            accept_task,
            status_task,
            status_shutdown: Some(shutdown_tx),
        })
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[cfg(test)]
    pub fn game_addr(&self) -> SocketAddr {
        self.game_addr
    }

    #[cfg(test)]
    pub fn status_addr(&self) -> SocketAddr {
        self.status_addr
    }

    /// Closes both sockets; the ports are free once this returns.
    pub async fn shutdown(mut self) {
        self.accept_task.abort();
        let _ = (&mut self.accept_task).await;

        if let Some(tx) = self.status_shutdown.take() {
            let _ = tx.send(());
        }
        if tokio::time::timeout(STATUS_SHUTDOWN_TIMEOUT, &mut self.status_task)
            .await
            .is_err()
        {
            tracing::warn!("sleeping status server did not drain in time; aborting");
            self.status_task.abort();
            let _ = (&mut self.status_task).await;
        }

        tracing::info!(
            generation = self.generation,
            game_addr = %self.game_addr,
            status_addr = %self.status_addr,
            "sleep gate closed"
        );
    }
}

impl Drop for SleepGate {
    fn drop(&mut self) {
        self.accept_task.abort();
        self.status_task.abort();
    }
}
