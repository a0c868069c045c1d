use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time;

/// A cancellable one-shot timer.
///
/// The timer owns the task it spawns: stopping or dropping it before the
/// deadline guarantees the deferred work never runs.
pub struct OneShot {
    handle: JoinHandle<()>,
}

impl OneShot {
    pub fn start<F>(timeout: Duration, work: F) -> OneShot
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            time::sleep(timeout).await;
            work.await;
        });
        OneShot { handle }
    }

    pub fn stop(&self) {
        self.handle.abort();
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }
}

impl Drop for OneShot {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
