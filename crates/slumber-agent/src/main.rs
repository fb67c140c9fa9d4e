mod config;
mod controller;
mod events;
mod idle_monitor;
mod notify;
mod process_supervisor;
mod sleep_gate;
mod support;
mod telemetry;
#[cfg(test)]
mod test_support;

use config::Settings;
use controller::Controller;
use notify::Notifier;
use process_supervisor::LaunchSpec;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = telemetry::init();
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "slumber-agent starting");

    let settings = match Settings::from_env() {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %support::format_error_chain(&e), "invalid configuration");
            return Err(e);
        }
    };
    tracing::info!(
        game_port = settings.game_port,
        rest_port = settings.rest_port,
        idle_timeout = %humantime::format_duration(settings.idle_timeout),
        world = %settings.world_path().display(),
        notifications = settings.ntfy.topic.is_some(),
        "configuration loaded"
    );

    let launch = LaunchSpec::tshock(&settings);
    let notifier = Notifier::new(settings.ntfy.clone());
    let controller = Controller::new(settings, launch, notifier);

    if let Err(e) = controller.run(shutdown_signal()).await {
        tracing::error!(error = %support::format_error_chain(&e), "supervisor failed");
        return Err(e);
    }
    tracing::info!("slumber-agent stopped");
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let (mut term, mut int) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
        (Ok(term), Ok(int)) => (term, int),
        _ => {
            tracing::warn!("unix signal handlers unavailable; falling back to ctrl-c");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = term.recv() => tracing::info!("received SIGTERM"),
        _ = int.recv() => tracing::info!("received SIGINT"),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("received ctrl-c");
}
