use std::net::SocketAddr;

use slumber_process::{RunId, ServerExit};
use tokio::sync::mpsc;

/// Signals collaborators send to the controller. Only the controller changes mode.
#[derive(Debug)]
pub enum Event {
    /// A wake trigger arrived on the game port of sleep gate `generation`.
    WakeRequested { generation: u64, peer: SocketAddr },
    /// The game server process of `run` ended, for whatever reason.
    ServerExited { run: RunId, exit: ServerExit },
    /// The idle monitor of `run` saw zero players for the whole idle timeout.
    IdleTimeout { run: RunId },
}

pub type EventSender = mpsc::UnboundedSender<Event>;
pub type EventReceiver = mpsc::UnboundedReceiver<Event>;

pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}
