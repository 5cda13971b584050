use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use log::{debug, error, info};

/// Cancel `shutdown` on SIGTERM or Ctrl-C. The handlers are installed before
/// this returns. The listener exits quietly once `shutdown` is cancelled by
/// anyone else.
pub fn spawn_signal_listener(shutdown: CancellationToken) -> JoinHandle<()> {
    let signals = Signals::install();

    tokio::spawn(async move {
        if signals.wait(&shutdown).await {
            shutdown.cancel();
        }
    })
}

#[cfg(unix)]
struct Signals {
    terminate: Option<tokio::signal::unix::Signal>,
    interrupt: Option<tokio::signal::unix::Signal>,
}

#[cfg(unix)]
impl Signals {
    fn install() -> Self {
        use tokio::signal::unix::SignalKind;

        Signals {
            terminate: install(SignalKind::terminate(), "SIGTERM"),
            interrupt: install(SignalKind::interrupt(), "SIGINT"),
        }
    }

    async fn wait(mut self, shutdown: &CancellationToken) -> bool {
        tokio::select! {
            Some(()) = recv(&mut self.terminate) => {
                info!("Received SIGTERM");
                true
            }
            Some(()) = recv(&mut self.interrupt) => {
                debug!("User keyboard interrupt");
                true
            }
            _ = shutdown.cancelled() => false,
        }
    }
}

#[cfg(unix)]
fn install(kind: tokio::signal::unix::SignalKind, name: &str) -> Option<tokio::signal::unix::Signal> {
    match tokio::signal::unix::signal(kind) {
        Ok(signal) => Some(signal),
        Err(e) => {
            error!("Cannot install {name} handler: {e}");
            None
        }
    }
}

#[cfg(unix)]
async fn recv(signal: &mut Option<tokio::signal::unix::Signal>) -> Option<()> {
    match signal {
        Some(signal) => signal.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(not(unix))]
struct Signals;

#[cfg(not(unix))]
impl Signals {
    fn install() -> Self {
        Signals
    }

    async fn wait(self, shutdown: &CancellationToken) -> bool {
        tokio::select! {
            result = tokio::signal::ctrl_c() => match result {
                Ok(()) => {
                    debug!("User keyboard interrupt");
                    true
                }
                Err(e) => {
                    error!("Cannot listen for Ctrl-C: {e}");
                    shutdown.cancelled().await;
                    false
                }
            },
            _ = shutdown.cancelled() => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_listener_exits_on_external_shutdown() {
        let shutdown = CancellationToken::new();
        let listener = spawn_signal_listener(shutdown.clone());

        shutdown.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(1), listener)
            .await
            .unwrap()
            .unwrap();
    }
}
