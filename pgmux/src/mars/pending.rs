use std::{
    pin::pin,
    sync::{Arc, Mutex, MutexGuard},
};
use tokio::sync::Notify;

/// How a [`PendingRead`] was resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// A message for the portal arrived.
    Delivered,
    /// The read failed, with SQLSTATE when the failure is specific to the portal.
    ///
    /// `None` means the whole connection failed, the reason is waiting in the portal channel.
    Failed(Option<String>),
    /// The consumer gave up waiting.
    Cancelled,
}

/// A consumer waiting for the next message of one portal.
///
/// Resolved at most once, by the reader task, by the consumer cancelling, or by connection failure.
#[derive(Debug)]
pub struct PendingRead {
    state: Mutex<State>,
    notify: Notify,
}

#[derive(Debug)]
struct State {
    outcome: Option<Outcome>,
    forced: bool,
}

impl PendingRead {
    pub fn new(forced: bool) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State { outcome: None, forced }),
            notify: Notify::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // state is a plain value, a panic while holding the lock cannot break it
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Forced reads ignore arriving messages and only resolve explicitly.
    pub fn is_forced(&self) -> bool {
        self.lock().forced
    }

    pub fn outcome(&self) -> Option<Outcome> {
        self.lock().outcome.clone()
    }

    /// Resolve the read, returns `false` if it was already resolved.
    pub fn resolve(&self, outcome: Outcome) -> bool {
        {
            let mut state = self.lock();
            if state.outcome.is_some() {
                return false;
            }
            state.outcome = Some(outcome);
        }
        self.notify.notify_waiters();
        true
    }

    /// Resolve as delivered unless the read is forced.
    pub fn deliver(&self) -> bool {
        if self.is_forced() {
            return false;
        }
        self.resolve(Outcome::Delivered)
    }

    /// Wait until resolved.
    pub async fn wait(&self) -> Outcome {
        loop {
            let mut notified = pin!(self.notify.notified());
            notified.as_mut().enable();

            if let Some(outcome) = self.outcome() {
                return outcome;
            }

            notified.await;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn resolves_once() {
        let read = PendingRead::new(false);
        assert!(read.resolve(Outcome::Cancelled));
        assert!(!read.resolve(Outcome::Delivered));
        assert_eq!(read.wait().await, Outcome::Cancelled);
    }

    #[tokio::test]
    async fn forced_read_ignores_delivery() {
        let read = PendingRead::new(true);
        assert!(!read.deliver());
        assert_eq!(read.outcome(), None);

        let waiter = tokio::spawn({
            let read = read.clone();
            async move { read.wait().await }
        });
        tokio::task::yield_now().await;

        assert!(read.resolve(Outcome::Failed(Some("40001".into()))));
        assert_eq!(waiter.await.unwrap(), Outcome::Failed(Some("40001".into())));
    }
}
