use std::{
    path::PathBuf,
    process::{ExitStatus, Stdio},
    time::Duration,
};

use slumber_process::{RunId, ServerExit};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::{Child, Command},
    sync::oneshot,
};

use crate::config::Settings;
use crate::events::{Event, EventSender};
use crate::telemetry::SERVER_LOG_TARGET;

/// What to run for the game server.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
}

impl LaunchSpec {
    /// `TShock.Server -configpath <data_root> -world <data_root>/<world>` run from the
    /// install directory.
    pub fn tshock(settings: &Settings) -> Self {
        Self {
            program: settings.server_binary.clone(),
            args: vec![
                "-configpath".to_string(),
                settings.data_root.display().to_string(),
                "-world".to_string(),
                settings.world_path().display().to_string(),
            ],
            cwd: settings.server_root.clone(),
        }
    }
}

/// The game server could not be spawned at all. Distinct from an exit after spawn.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("spawn {program} (cwd {cwd})")]
    Spawn {
        program: String,
        cwd: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy)]
enum OutputStream {
    Stdout,
    Stderr,
}

fn clean_line(raw: &[u8]) -> Option<String> {
    let line = String::from_utf8_lossy(raw);
    let line = line.trim_end_matches(['\n', '\r']);
    if line.trim().is_empty() {
        None
    } else {
        Some(line.to_string())
    }
}

async fn forward_lines<R: AsyncRead + Unpin>(reader: R, stream: OutputStream) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let Some(line) = clean_line(&buf) else {
                    continue;
                };
                match stream {
                    OutputStream::Stdout => tracing::info!(target: SERVER_LOG_TARGET, "{line}"),
                    OutputStream::Stderr => tracing::error!(target: SERVER_LOG_TARGET, "{line}"),
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, ?stream, "server output stream closed");
                break;
            }
        }
    }
}

#[cfg(target_os = "linux")]
fn set_parent_death_signal() -> std::io::Result<()> {
    // The game server must not outlive a crashed supervisor.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(all(unix, not(target_os = "linux")))]
fn set_parent_death_signal() -> std::io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn signal_group(pgid: Option<i32>, signal: i32) -> bool {
    let Some(pgid) = pgid else {
        return false;
    };
    unsafe { libc::kill(-pgid, signal) == 0 }
}

fn exit_from_status(res: std::io::Result<ExitStatus>, runtime: Duration) -> ServerExit {
    let runtime_ms = runtime.as_millis() as u64;
    match res {
        Ok(status) => {
            #[cfg(unix)]
            let signal = std::os::unix::process::ExitStatusExt::signal(&status);
            #[cfg(not(unix))]
            let signal = None;
            ServerExit {
                code: status.code(),
                signal,
                runtime_ms,
                wait_error: None,
            }
        }
        Err(e) => ServerExit {
            code: None,
            signal: None,
            runtime_ms,
            wait_error: Some(e.to_string()),
        },
    }
}

/// Waits for the child; on a stop request sends SIGTERM and escalates to SIGKILL
/// after `grace`. Reports the exit exactly once.
async fn supervise(
    mut child: Child,
    pgid: Option<i32>,
    run: RunId,
    grace: Duration,
    mut stop_rx: oneshot::Receiver<()>,
    events: EventSender,
) {
    let started = tokio::time::Instant::now();

    let res = tokio::select! {
        res = child.wait() => res,
        _ = &mut stop_rx => {
            #[cfg(unix)]
            let term_sent = signal_group(pgid, libc::SIGTERM);
            #[cfg(not(unix))]
            let term_sent = child.start_kill().is_ok();
            tracing::info!(%run, term_sent, grace_ms = grace.as_millis() as u64, "stop: sent SIGTERM");

            match tokio::time::timeout(grace, child.wait()).await {
                Ok(res) => res,
                Err(_) => {
                    tracing::warn!(%run, "server ignored SIGTERM; sending SIGKILL");
                    #[cfg(unix)]
                    {
                        if !signal_group(pgid, libc::SIGKILL) {
                            let _ = child.start_kill();
                        }
                    }
                    #[cfg(not(unix))]
                    {
                        let _ = child.start_kill();
                    }
                    child.wait().await
                }
            }
        }
    };

    let exit = exit_from_status(res, started.elapsed());
    if exit.is_clean() {
        tracing::info!(%run, runtime_ms = exit.runtime_ms, "server process exited");
    } else {
        tracing::warn!(
            %run,
            code = ?exit.code,
            signal = ?exit.signal,
            error = ?exit.wait_error,
            runtime_ms = exit.runtime_ms,
            "server process exited"
        );
    }
    let _ = events.send(Event::ServerExited { run, exit });
}

/// Ownership of one running game server. The exit is reported through the event
/// channel, never through this handle. Dropping the handle also requests a stop.
#[derive(Debug)]
pub struct ServerHandle {
    run: RunId,
    pid: Option<u32>,
    stop_tx: Option<oneshot::Sender<()>>,
}

impl ServerHandle {
    pub fn run(&self) -> &RunId {
        &self.run
    }

    #[cfg(test)]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Requests a graceful stop without waiting for it. Repeated calls are no-ops.
    pub fn kill(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            tracing::info!(run = %self.run, pid = ?self.pid, "stop requested");
            let _ = tx.send(());
        }
    }
}

/// Spawns the game server and returns as soon as the process exists. Readiness is
/// left to the idle monitor.
pub fn start(
    spec: &LaunchSpec,
    run: RunId,
    grace: Duration,
    events: EventSender,
) -> Result<ServerHandle, LaunchError> {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .current_dir(&spec.cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    #[cfg(unix)]
    {
        unsafe {
            cmd.pre_exec(|| {
                set_parent_death_signal()?;
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }

    tracing::info!(
        %run,
        program = %spec.program.display(),
        args = %spec.args.join(" "),
        cwd = %spec.cwd.display(),
        "spawning game server"
    );

    let mut child = cmd.spawn().map_err(|source| LaunchError::Spawn {
        program: spec.program.display().to_string(),
        cwd: spec.cwd.display().to_string(),
        source,
    })?;
    let pid = child.id();
    // setsid makes the child its own process group leader.
    let pgid = pid.map(|p| p as i32);

    if let Some(out) = child.stdout.take() {
        tokio::spawn(forward_lines(out, OutputStream::Stdout));
    }
    if let Some(err) = child.stderr.take() {
        tokio::spawn(forward_lines(err, OutputStream::Stderr));
    }

    let (stop_tx, stop_rx) = oneshot::channel();
    tokio::spawn(supervise(child, pgid, run.clone(), grace, stop_rx, events));

    tracing::info!(%run, ?pid, "game server spawned");
    Ok(ServerHandle {
        run,
        pid,
        stop_tx: Some(stop_tx),
    })
}
