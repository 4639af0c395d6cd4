use anyhow::Result;
use tokio::signal;

/// Signals that can trigger shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    CtrlC,
    Sigterm,
    Sigquit,
    Sighup,
}

/// Capability announced by a module that re-reads configuration on `SIGHUP`.
///
/// While it is present a hangup is left to that module; otherwise `SIGHUP` stops the program
/// like any other termination signal.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReloadOnHangup;

/// Wait for the first termination signal (Ctrl+C, SIGTERM, SIGQUIT, or an unclaimed SIGHUP).
///
/// `hangup_is_reload` is consulted on every `SIGHUP`; when it returns `true` the hangup is
/// ignored here and waiting continues.
///
/// # Errors
/// Returns an error if a signal handler cannot be installed.
pub async fn wait_for_shutdown<F>(hangup_is_reload: F) -> Result<ShutdownSignal>
where
    F: Fn() -> bool,
{
    let signal = wait_first(hangup_is_reload).await?;
    tracing::info!(?signal, "Shutdown signal received, initiating graceful shutdown");
    Ok(signal)
}

async fn wait_ctrl_c() -> Result<ShutdownSignal> {
    signal::ctrl_c().await.map_err(|e| {
        tracing::error!(%e, "Error handling Ctrl+C signal");
        e
    })?;
    Ok(ShutdownSignal::CtrlC)
}

#[cfg(unix)]
async fn wait_first<F>(hangup_is_reload: F) -> Result<ShutdownSignal>
where
    F: Fn() -> bool,
{
    use signal::unix::SignalKind;

    let mut terminate = install(SignalKind::terminate(), ShutdownSignal::Sigterm)?;
    let mut quit = install(SignalKind::quit(), ShutdownSignal::Sigquit)?;
    let mut hangup = install(SignalKind::hangup(), ShutdownSignal::Sighup)?;
    let ctrl_c = wait_ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            result = &mut ctrl_c => return result,
            _ = terminate.recv() => return Ok(ShutdownSignal::Sigterm),
            _ = quit.recv() => return Ok(ShutdownSignal::Sigquit),
            _ = hangup.recv() => {
                if !hangup_is_reload() {
                    return Ok(ShutdownSignal::Sighup);
                }
                tracing::debug!("SIGHUP left to the configuration reloader");
            }
        }
    }
}

#[cfg(unix)]
fn install(
    kind: signal::unix::SignalKind,
    which: ShutdownSignal,
) -> Result<signal::unix::Signal> {
    signal::unix::signal(kind).map_err(|e| {
        tracing::error!(%e, signal = ?which, "Failed to install signal handler");
        e.into()
    })
}

#[cfg(not(unix))]
async fn wait_first<F>(_hangup_is_reload: F) -> Result<ShutdownSignal>
where
    F: Fn() -> bool,
{
    wait_ctrl_c().await
}

#[cfg(all(test, unix))]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::signal::unix::{SignalKind, signal};

    fn send_hangup() {
        let pid = std::process::id();
        let status = std::process::Command::new("sh")
            .arg("-c")
            .arg(format!("kill -HUP {pid}"))
            .status()
            .unwrap();
        assert!(status.success());
    }

    #[tokio::test]
    async fn unclaimed_hangup_stops() {
        // Keep a handler alive so the default disposition never applies to this process.
        let _keep = signal(SignalKind::hangup()).unwrap();
        let waiter = tokio::spawn(wait_for_shutdown(|| false));

        let got = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                send_hangup();
                tokio::time::sleep(Duration::from_millis(50)).await;
                if waiter.is_finished() {
                    break waiter.await;
                }
            }
        })
        .await
        .unwrap()
        .unwrap()
        .unwrap();
        assert_eq!(got, ShutdownSignal::Sighup);
    }

    #[tokio::test]
    async fn claimed_hangup_keeps_waiting() {
        let _keep = signal(SignalKind::hangup()).unwrap();
        let waiter = tokio::spawn(wait_for_shutdown(|| true));

        for _ in 0..5 {
            send_hangup();
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(!waiter.is_finished());
        waiter.abort();
    }
}
