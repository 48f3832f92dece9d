//! Single-notification wait-with-deadline.
//!
//! A notification sent before anyone waits is kept (one permit, not a
//! count), so a reply that races ahead of its waiter is not lost.

use std::time::Duration;

use tokio::sync::Notify;

#[derive(Debug, Default)]
pub struct Signal {
    notify: Notify,
}

impl Signal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&self) {
        self.notify.notify_one();
    }

    /// Wait for a notification. `None` waits forever. Returns false on
    /// timeout.
    pub async fn wait(&self, timeout: Option<Duration>) -> bool {
        match timeout {
            Some(limit) => tokio::time::timeout(limit, self.notify.notified())
                .await
                .is_ok(),
            None => {
                self.notify.notified().await;
                true
            }
        }
    }
}
