use tokio::sync::watch;

/// Handle for stopping in-flight upstream streams.
///
/// One handle is created per process; every stream tap holds a clone and
/// stops pulling from upstream once it fires.
#[derive(Clone)]
pub struct StreamCancelHandle {
    sender: watch::Sender<bool>,
    receiver: watch::Receiver<bool>,
}

impl StreamCancelHandle {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self { sender, receiver }
    }

    /// Signal cancellation. Idempotent.
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    /// Check if cancelled
    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once the handle has been cancelled.
    ///
    /// Never resolves if every handle is dropped without cancelling.
    pub async fn cancelled(&self) {
        let mut rx = self.receiver.clone();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

impl Default for StreamCancelHandle {
    fn default() -> Self {
        Self::new()
    }
}
