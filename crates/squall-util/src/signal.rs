use futures::{stream::FuturesUnordered, StreamExt as _};
use nix::sys::signal::Signal;
use tokio::signal::unix::{self, Signal as TokioSignal, SignalKind};

/// The process-terminating signals that trigger a monitor shutdown.
const SHUTDOWN: [Signal; 4] = [Signal::SIGTERM, Signal::SIGINT, Signal::SIGHUP, Signal::SIGQUIT];

/// Waits for shutdown signals. Each call to [`recv`](Self::recv) yields the
/// next delivery, so the caller can log repeated signals while the first
/// shutdown is still draining.
pub struct ShutdownSignals {
    signals: Vec<(Signal, TokioSignal)>,
}

impl ShutdownSignals {
    pub fn new() -> Self {
        let signals = SHUTDOWN
            .into_iter()
            .map(|sig| {
                let tokio_sig = unix::signal(SignalKind::from_raw(sig as i32))
                    .unwrap_or_else(|_| panic!("failed to register signal handler for {sig}"));
                (sig, tokio_sig)
            })
            .collect();
        Self { signals }
    }

    pub async fn recv(&mut self) -> Signal {
        let mut futs: FuturesUnordered<_> = self
            .signals
            .iter_mut()
            .map(|(sig, tokio_sig)| async move {
                tokio_sig.recv().await;
                *sig
            })
            .collect();
        futs.next().await.expect("shutdown signal set is non-empty")
    }
}

impl Default for ShutdownSignals {
    fn default() -> Self {
        Self::new()
    }
}
