use std::future::Future;

use anyhow::Context;
use slumber_process::{Mode, RunId, ServerExit};
use tokio::sync::watch;

use crate::config::Settings;
use crate::events::{self, Event, EventReceiver, EventSender};
use crate::idle_monitor::{IdleMonitor, StatusProbe};
use crate::notify::{Notice, Notifier};
use crate::process_supervisor::{self, LaunchSpec, ServerHandle};
use crate::sleep_gate::SleepGate;
use crate::support::format_error_chain;

/// Owns the mode and every lifecycle handle. Collaborators only send events; all
/// transitions happen inside [`Controller::run`].
pub struct Controller {
    settings: Settings,
    launch: LaunchSpec,
    notifier: Notifier,
    mode_tx: watch::Sender<Mode>,
    events_tx: EventSender,
    events_rx: EventReceiver,
    gate: Option<SleepGate>,
    gate_generation: u64,
    server: Option<ServerHandle>,
    monitor: Option<IdleMonitor>,
    exiting: bool,
}

impl Controller {
    pub fn new(settings: Settings, launch: LaunchSpec, notifier: Notifier) -> Self {
        let (mode_tx, _) = watch::channel(Mode::Sleeping);
        let (events_tx, events_rx) = events::channel();
        Self {
            settings,
            launch,
            notifier,
            mode_tx,
            events_tx,
            events_rx,
            gate: None,
            gate_generation: 0,
            server: None,
            monitor: None,
            exiting: false,
        }
    }

    pub fn mode(&self) -> Mode {
        *self.mode_tx.borrow()
    }

    #[cfg(test)]
    pub fn subscribe(&self) -> watch::Receiver<Mode> {
        self.mode_tx.subscribe()
    }

    /// Binds the sleep gate and serves events until `shutdown` resolves and the
    /// server (if running) has exited. Bind failures are fatal.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) -> anyhow::Result<()> {
        self.enter_sleeping().await?;

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown, if !self.exiting => {
                    if self.begin_exit().await {
                        return Ok(());
                    }
                }
                ev = self.events_rx.recv() => {
                    // The controller holds a sender, so the channel never closes.
                    let Some(ev) = ev else {
                        return Ok(());
                    };
                    if self.handle(ev).await? {
                        return Ok(());
                    }
                }
            }
        }
    }

    fn set_mode(&self, mode: Mode) {
        let from = self.mode_tx.send_replace(mode);
        if from != mode {
            tracing::info!(%from, to = %mode, "mode changed");
        }
    }

    async fn enter_sleeping(&mut self) -> anyhow::Result<()> {
        self.gate_generation += 1;
        let gate = SleepGate::bind(&self.settings, self.gate_generation, self.events_tx.clone())
            .await
            .context("bind sleep gate")?;
        self.gate = Some(gate);
        self.set_mode(Mode::Sleeping);
        Ok(())
    }

    /// Returns true when the run loop should stop.
    async fn handle(&mut self, ev: Event) -> anyhow::Result<bool> {
        match ev {
            Event::WakeRequested { generation, peer } => {
                let current = self.gate.as_ref().map(|g| g.generation());
                if self.mode() != Mode::Sleeping || current != Some(generation) {
                    tracing::debug!(generation, ?current, %peer, "ignoring stale wake request");
                    return Ok(false);
                }
                tracing::info!(%peer, "wake requested");
                self.wake().await?;
                Ok(false)
            }
            Event::IdleTimeout { run } => {
                if !self.is_current(&run) || self.mode() != Mode::Awake {
                    tracing::debug!(%run, "ignoring stale idle timeout");
                    return Ok(false);
                }
                self.notifier.send(Notice::IdleShutdown);
                if let Some(server) = self.server.as_mut() {
                    server.kill();
                }
                self.set_mode(Mode::Stopping);
                Ok(false)
            }
            Event::ServerExited { run, exit } => {
                if !self.is_current(&run) {
                    tracing::debug!(%run, "ignoring exit of a previous run");
                    return Ok(false);
                }
                self.on_server_exit(run, exit).await
            }
        }
    }

    fn is_current(&self, run: &RunId) -> bool {
        self.server.as_ref().is_some_and(|s| s.run() == run)
    }

    async fn wake(&mut self) -> anyhow::Result<()> {
        // Ports must be free before the real server binds them.
        if let Some(gate) = self.gate.take() {
            gate.shutdown().await;
        }
        self.set_mode(Mode::Starting);
        self.notifier.send(Notice::Starting);

        let run = RunId::new();
        match process_supervisor::start(
            &self.launch,
            run.clone(),
            self.settings.stop_grace,
            self.events_tx.clone(),
        ) {
            Ok(handle) => {
                let probe = StatusProbe::new(
                    self.settings.status_url.clone(),
                    self.settings.poll_interval,
                );
                self.monitor = Some(IdleMonitor::spawn(
                    run,
                    probe,
                    self.settings.poll_interval,
                    self.settings.idle_timeout,
                    self.events_tx.clone(),
                ));
                self.server = Some(handle);
                self.set_mode(Mode::Awake);
                Ok(())
            }
            Err(e) => {
                tracing::error!(
                    %run,
                    error = %format_error_chain(&anyhow::Error::from(e)),
                    "game server failed to start"
                );
                self.notifier.send(Notice::StartFailed);
                self.enter_sleeping().await
            }
        }
    }

    async fn on_server_exit(&mut self, run: RunId, exit: ServerExit) -> anyhow::Result<bool> {
        if self.mode() == Mode::Awake {
            tracing::warn!(%run, code = ?exit.code, signal = ?exit.signal, "game server exited unexpectedly");
        }
        if let Some(monitor) = self.monitor.take() {
            monitor.cancel();
        }
        self.server = None;

        if self.exiting {
            tracing::info!(%run, "game server stopped; exiting");
            return Ok(true);
        }
        self.enter_sleeping().await?;
        Ok(false)
    }

    /// Starts an orderly exit. Returns true when nothing is left to wait for.
    async fn begin_exit(&mut self) -> bool {
        self.exiting = true;
        tracing::info!(mode = %self.mode(), "shutdown requested");

        if let Some(server) = self.server.as_mut() {
            server.kill();
            self.set_mode(Mode::Stopping);
            return false;
        }
        if let Some(gate) = self.gate.take() {
            gate.shutdown().await;
        }
        true
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::{
        net::{Ipv4Addr, SocketAddr},
        path::PathBuf,
        time::Duration,
    };

    use tokio::{
        net::{TcpListener, TcpStream},
        sync::oneshot,
    };

    use super::*;
    use crate::config::NtfyConfig;
    use crate::test_support::{MockNtfy, MockStatus, free_port};

    const WITHIN: Duration = Duration::from_secs(5);

    fn sh(script: &str) -> LaunchSpec {
        LaunchSpec {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), script.to_string()],
            cwd: std::env::temp_dir(),
        }
    }

    fn peer() -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, 50_000))
    }

    fn with_ntfy(mut settings: Settings, ntfy: &MockNtfy) -> (Settings, Notifier) {
        settings.ntfy = NtfyConfig {
            topic: Some(ntfy.url.clone()),
            auth: None,
        };
        let notifier = Notifier::new(settings.ntfy.clone());
        (settings, notifier)
    }

    async fn next_event(c: &mut Controller) -> Event {
        tokio::time::timeout(WITHIN, c.events_rx.recv())
            .await
            .expect("event in time")
            .expect("channel open")
    }

    async fn wait_mode(modes: &mut watch::Receiver<Mode>, want: Mode) {
        tokio::time::timeout(WITHIN, modes.wait_for(|m| *m == want))
            .await
            .unwrap_or_else(|_| panic!("mode {want} not reached"))
            .unwrap();
    }

    async fn connect_when_bound(addr: SocketAddr) {
        let deadline = tokio::time::Instant::now() + WITHIN;
        loop {
            if TcpStream::connect(addr).await.is_ok() {
                return;
            }
            assert!(tokio::time::Instant::now() < deadline, "{addr} never bound");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn idle_cycle_end_to_end() {
        let status = MockStatus::start(Some(1)).await;
        let ntfy = MockNtfy::start().await;
        let mut settings = Settings::for_tests();
        settings.game_port = free_port();
        settings.rest_port = free_port();
        settings.status_url = status.url.clone();
        let game = SocketAddr::from((Ipv4Addr::LOCALHOST, settings.game_port));
        let (settings, notifier) = with_ntfy(settings, &ntfy);

        let controller = Controller::new(settings, sh("sleep 30"), notifier);
        let mut modes = controller.subscribe();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(controller.run(async {
            let _ = stop_rx.await;
        }));

        // A player connects to the sleeping server.
        connect_when_bound(game).await;
        wait_mode(&mut modes, Mode::Awake).await;
        assert!(ntfy.wait_for_tag("arrows_clockwise", WITHIN).await);

        // Players online keep it awake past the idle timeout.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(*modes.borrow(), Mode::Awake);

        // Everyone leaves.
        status.set(Some(0));
        wait_mode(&mut modes, Mode::Sleeping).await;
        assert!(ntfy.wait_for_tag("stop_sign", WITHIN).await);

        // The gate is back and wakes the server again.
        status.set(Some(1));
        connect_when_bound(game).await;
        wait_mode(&mut modes, Mode::Awake).await;

        // Shutdown while awake stops the server, then returns.
        let _ = stop_tx.send(());
        tokio::time::timeout(WITHIN, task)
            .await
            .expect("controller exits")
            .unwrap()
            .unwrap();
        assert!(!ntfy.tags().iter().any(|t| t == "face_with_thermometer"));
        TcpListener::bind(game).await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_while_sleeping_unbinds_gate() {
        let mut settings = Settings::for_tests();
        settings.game_port = free_port();
        settings.rest_port = free_port();
        let game = SocketAddr::from((Ipv4Addr::LOCALHOST, settings.game_port));
        let rest = SocketAddr::from((Ipv4Addr::LOCALHOST, settings.rest_port));

        let controller = Controller::new(settings, sh("sleep 30"), Notifier::default());
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(controller.run(async {
            let _ = stop_rx.await;
        }));
        connect_when_bound(rest).await;
        let body: serde_json::Value = reqwest::get(format!("http://{rest}/v2/server/status"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["playercount"], "SLEEPING");
        assert_eq!(body["port"], u64::from(game.port()));

        let _ = stop_tx.send(());
        tokio::time::timeout(WITHIN, task)
            .await
            .expect("controller exits")
            .unwrap()
            .unwrap();
        TcpListener::bind(game).await.unwrap();
        TcpListener::bind(rest).await.unwrap();
    }

    #[tokio::test]
    async fn startup_bind_failure_is_fatal() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut settings = Settings::for_tests();
        settings.game_port = taken.local_addr().unwrap().port();

        let controller = Controller::new(settings, sh("sleep 30"), Notifier::default());
        let err = controller
            .run(std::future::pending())
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("bind game port"));
    }

    #[tokio::test]
    async fn spawn_failure_returns_to_sleeping() {
        let ntfy = MockNtfy::start().await;
        let (settings, notifier) = with_ntfy(Settings::for_tests(), &ntfy);
        let launch = LaunchSpec {
            program: PathBuf::from("/nonexistent/TShock.Server"),
            args: Vec::new(),
            cwd: std::env::temp_dir(),
        };
        let mut c = Controller::new(settings, launch, notifier);
        c.enter_sleeping().await.unwrap();
        let generation = c.gate_generation;

        let done = c
            .handle(Event::WakeRequested {
                generation,
                peer: peer(),
            })
            .await
            .unwrap();
        assert!(!done);
        assert_eq!(c.mode(), Mode::Sleeping);
        assert!(c.server.is_none());
        assert!(c.monitor.is_none());
        let gate = c.gate.as_ref().expect("gate rebound");
        assert_eq!(gate.generation(), generation + 1);
        TcpStream::connect(gate.game_addr()).await.unwrap();

        assert!(ntfy.wait_for_tag("arrows_clockwise", WITHIN).await);
        assert!(ntfy.wait_for_tag("face_with_thermometer", WITHIN).await);
        let failed = ntfy
            .pushed()
            .into_iter()
            .find(|p| p.tags.as_deref() == Some("face_with_thermometer"))
            .unwrap();
        assert_eq!(failed.priority.as_deref(), Some("4"));

        if let Some(gate) = c.gate.take() {
            gate.shutdown().await;
        }
    }

    #[tokio::test]
    async fn stale_events_are_ignored() {
        let ntfy = MockNtfy::start().await;
        let (settings, notifier) = with_ntfy(Settings::for_tests(), &ntfy);
        let mut c = Controller::new(settings, sh("sleep 30"), notifier);
        c.enter_sleeping().await.unwrap();
        let generation = c.gate_generation;

        // Wake from a gate that no longer exists.
        c.handle(Event::WakeRequested {
            generation: generation - 1,
            peer: peer(),
        })
        .await
        .unwrap();
        assert_eq!(c.mode(), Mode::Sleeping);
        assert!(c.server.is_none());

        c.handle(Event::WakeRequested {
            generation,
            peer: peer(),
        })
        .await
        .unwrap();
        assert_eq!(c.mode(), Mode::Awake);
        assert!(c.gate.is_none());
        assert!(c.monitor.is_some());
        let run = c.server.as_ref().unwrap().run().clone();

        // A duplicate wake from the same generation changes nothing.
        c.handle(Event::WakeRequested {
            generation,
            peer: peer(),
        })
        .await
        .unwrap();
        assert_eq!(c.server.as_ref().unwrap().run(), &run);

        c.handle(Event::IdleTimeout { run: RunId::new() }).await.unwrap();
        c.handle(Event::ServerExited {
            run: RunId::new(),
            exit: ServerExit {
                code: Some(0),
                signal: None,
                runtime_ms: 1,
                wait_error: None,
            },
        })
        .await
        .unwrap();
        assert_eq!(c.mode(), Mode::Awake);
        assert!(!ntfy.tags().iter().any(|t| t == "stop_sign"));

        c.handle(Event::IdleTimeout { run: run.clone() }).await.unwrap();
        assert_eq!(c.mode(), Mode::Stopping);
        assert!(ntfy.wait_for_tag("stop_sign", WITHIN).await);

        match next_event(&mut c).await {
            ev @ Event::ServerExited { .. } => {
                assert!(!c.handle(ev).await.unwrap());
            }
            other => panic!("expected server exit, got {other:?}"),
        }
        assert_eq!(c.mode(), Mode::Sleeping);
        assert!(c.server.is_none());
        assert!(c.monitor.is_none());
        assert_eq!(c.gate.as_ref().unwrap().generation(), generation + 1);

        // A second idle timeout for the finished run is stale.
        c.handle(Event::IdleTimeout { run }).await.unwrap();
        assert_eq!(c.mode(), Mode::Sleeping);

        if let Some(gate) = c.gate.take() {
            gate.shutdown().await;
        }
    }

    #[tokio::test]
    async fn crash_returns_to_sleeping() {
        let mut c = Controller::new(
            Settings::for_tests(),
            sh("sleep 0.3; exit 7"),
            Notifier::default(),
        );
        c.enter_sleeping().await.unwrap();
        let generation = c.gate_generation;
        c.handle(Event::WakeRequested {
            generation,
            peer: peer(),
        })
        .await
        .unwrap();
        assert_eq!(c.mode(), Mode::Awake);

        match next_event(&mut c).await {
            Event::ServerExited { run, exit } => {
                assert_eq!(exit.code, Some(7));
                assert!(!c.handle(Event::ServerExited { run, exit }).await.unwrap());
            }
            other => panic!("expected server exit, got {other:?}"),
        }
        assert_eq!(c.mode(), Mode::Sleeping);
        assert!(c.monitor.is_none());

        // The rebound gate wakes again.
        let game = c.gate.as_ref().unwrap().game_addr();
        TcpStream::connect(game).await.unwrap();
        match next_event(&mut c).await {
            Event::WakeRequested { generation: g, .. } => assert_eq!(g, generation + 1),
            other => panic!("expected wake, got {other:?}"),
        }

        if let Some(gate) = c.gate.take() {
            gate.shutdown().await;
        }
    }

    #[tokio::test]
    async fn exit_waits_for_the_server() {
        let mut c = Controller::new(Settings::for_tests(), sh("sleep 30"), Notifier::default());
        c.enter_sleeping().await.unwrap();
        let generation = c.gate_generation;
        c.handle(Event::WakeRequested {
            generation,
            peer: peer(),
        })
        .await
        .unwrap();

        assert!(!c.begin_exit().await);
        assert_eq!(c.mode(), Mode::Stopping);

        match next_event(&mut c).await {
            ev @ Event::ServerExited { .. } => assert!(c.handle(ev).await.unwrap()),
            other => panic!("expected server exit, got {other:?}"),
        }
        // No gate is rebound on the way out.
        assert!(c.gate.is_none());
        assert!(c.server.is_none());
    }
}
