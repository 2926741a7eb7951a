use std::sync::Arc;

use tokio::sync::watch;

/// Cancellation signal shared by every loop of an agent.
///
/// Clones observe the same flag: a single [`ShutdownSender::send_signal`]
/// wakes all of them, including clones made after the signal was sent.
#[derive(Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn new() -> (ShutdownSender, ShutdownSignal) {
        let (tx, rx) = watch::channel(false);
        (ShutdownSender(Arc::new(tx)), ShutdownSignal { rx })
    }

    /// Resolves once shutdown has been requested, or every sender is gone.
    pub async fn recv(&mut self) {
        let _ = self.rx.wait_for(|stop| *stop).await;
    }

    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }
}

#[derive(Clone)]
pub struct ShutdownSender(Arc<watch::Sender<bool>>);

impl ShutdownSender {
    pub fn send_signal(&self) {
        self.0.send_replace(true);
    }
}
