//! Cancellable background loops with confirmed shutdown.

use log::debug;
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The owner asked the loop to stop.
    Signalled,
    /// The owning context was cancelled.
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    AlreadyFinished,
    Exited,
    ExitedAfterCancel,
    Aborted,
}

/// Handed to the loop body. Observes both the stop signal and the
/// cancellation token.
pub struct LoopSignals {
    token: CancellationToken,
    stop_rx: mpsc::Receiver<()>,
}

impl LoopSignals {
    pub async fn stopped(&mut self) -> StopReason {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => StopReason::Cancelled,
            _ = self.stop_rx.recv() => StopReason::Signalled,
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// A spawned loop that can be stopped with confirmation that it has exited.
pub struct LoopTask {
    name: &'static str,
    token: CancellationToken,
    stop_tx: mpsc::Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl LoopTask {
    pub fn spawn<F, Fut>(name: &'static str, parent: &CancellationToken, body: F) -> Self
    where
        F: FnOnce(LoopSignals) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = parent.child_token();
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let signals = LoopSignals {
            token: token.clone(),
            stop_rx,
        };
        let handle = tokio::spawn(body(signals));
        Self {
            name,
            token,
            stop_tx,
            handle: Some(handle),
        }
    }

    /// Best-effort and non-blocking. Repeated calls are harmless.
    pub fn signal_stop(&self) {
        let _ = self.stop_tx.try_send(());
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(|h| h.is_finished())
    }

    /// Signals the loop, gives it `grace` to exit, then cancels it, then
    /// aborts it. Returns only once the task has terminated.
    pub async fn stop(mut self, grace: Duration) -> StopOutcome {
        let Some(mut handle) = self.handle.take() else {
            return StopOutcome::AlreadyFinished;
        };
        if handle.is_finished() {
            let _ = handle.await;
            return StopOutcome::AlreadyFinished;
        }

        self.signal_stop();
        if tokio::time::timeout(grace, &mut handle).await.is_ok() {
            return StopOutcome::Exited;
        }

        debug!("{} did not exit within {:?}, cancelling", self.name, grace);
        self.token.cancel();
        if tokio::time::timeout(grace, &mut handle).await.is_ok() {
            return StopOutcome::ExitedAfterCancel;
        }

        debug!("{} ignored cancellation, aborting", self.name);
        handle.abort();
        let _ = handle.await;
        StopOutcome::Aborted
    }
}

impl Drop for LoopTask {
    fn drop(&mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
