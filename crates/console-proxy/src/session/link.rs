//! Teardown handle for a session's live WebSocket/tunnel pair.

use std::sync::Arc;
use tokio::sync::watch;

/// Handle on one browser attachment. Closing it asks both relay legs to stop.
///
/// Each call to [`SessionRegistry::begin_connect`](super::SessionRegistry::begin_connect)
/// mints a new link with a fresh id, so a stale pump can be told apart from
/// the one currently attached.
#[derive(Debug, Clone)]
pub struct Link {
    id: u64,
    closed: Arc<watch::Sender<bool>>,
}

impl Link {
    pub fn new(id: u64) -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            id,
            closed: Arc::new(tx),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Request teardown. Idempotent.
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// A receiver that resolves once the link is closed.
    pub fn watch(&self) -> LinkWatch {
        LinkWatch(self.closed.subscribe())
    }
}

/// Receiving side of a [`Link`].
pub struct LinkWatch(watch::Receiver<bool>);

impl LinkWatch {
    /// Wait until the link is closed. Returns immediately if it already is.
    pub async fn closed(&mut self) {
        loop {
            let closed = *self.0.borrow_and_update();
            if closed || self.0.changed().await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn watch_sees_close_made_before_subscribing() {
        let link = Link::new(1);
        link.close();
        let mut watch = link.watch();
        tokio::time::timeout(Duration::from_secs(1), watch.closed())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn watch_wakes_on_close() {
        let link = Link::new(7);
        let mut watch = link.watch();
        let waiter = tokio::spawn(async move { watch.closed().await });
        tokio::task::yield_now().await;
        assert!(!link.is_closed());
        link.close();
        link.close();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(link.is_closed());
    }
}
