//! Functions that are useful for communicating between tasks and threads
//! within a program.

use tokio::sync::{mpsc::UnboundedReceiver, watch};

/// Read messages from a channel, calling an individual function on each one.
/// Return when there are no more channel senders.
pub async fn channel_reader<MessageT>(
    mut channel: UnboundedReceiver<MessageT>,
    mut processor: impl FnMut(MessageT),
) {
    while let Some(x) = channel.recv().await {
        processor(x);
    }
}

/// A write-once cell holding a value many tasks may wait for.
///
/// The monitor waits on each wrapper child exactly once, then publishes the
/// exit status through one of these. The per-runner handler, `kill_runner`,
/// and the shutdown sweep all observe the same memoized result through
/// independent [`StatusWaiter`]s.
pub struct StatusCell<T> {
    sender: watch::Sender<Option<T>>,
}

impl<T: Clone> StatusCell<T> {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        StatusCell {
            sender: watch::Sender::new(None),
        }
    }

    /// Publish the value. Later calls are ignored: the first result wins.
    pub fn set(&self, value: T) {
        self.sender.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(value);
                true
            } else {
                false
            }
        });
    }

    /// The value, if it has been published.
    pub fn get(&self) -> Option<T> {
        self.sender.borrow().clone()
    }

    pub fn waiter(&self) -> StatusWaiter<T> {
        StatusWaiter(self.sender.subscribe())
    }
}

#[derive(Clone)]
pub struct StatusWaiter<T>(watch::Receiver<Option<T>>);

impl<T: Clone> StatusWaiter<T> {
    /// Wait for the value to be published. Can be called any number of times
    /// on any number of waiters; every call yields the same value.
    pub async fn wait(&mut self) -> T {
        let guard = self
            .0
            .wait_for(Option::is_some)
            .await
            .expect("status cell dropped before publishing a value");
        guard.as_ref().cloned().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::time::Duration;
    use tokio::{sync::mpsc, task, time};

    #[tokio::test]
    async fn no_messages() {
        let (_, rx) = mpsc::unbounded_channel::<u8>();
        let mut vec = vec![];
        channel_reader(rx, |s| vec.push(s)).await;
        assert!(vec.is_empty(), "{vec:?}");
    }

    #[tokio::test]
    async fn three_messages() {
        let (tx, rx) = mpsc::unbounded_channel();
        task::spawn(async move {
            tx.send(1).unwrap();
            tx.send(2).unwrap();
            tx.send(3).unwrap();
        });
        let mut vec = vec![];
        channel_reader(rx, |s| vec.push(s)).await;

        assert_eq!(vec, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn status_waiters_all_see_the_value() {
        let cell = StatusCell::new();
        let mut before = cell.waiter();
        let handle = task::spawn(async move { before.wait().await });
        time::sleep(Duration::from_millis(10)).await;
        cell.set(17);
        assert_eq!(handle.await.unwrap(), 17);

        let mut after = cell.waiter();
        assert_eq!(after.wait().await, 17);
        assert_eq!(after.wait().await, 17);
        assert_eq!(cell.get(), Some(17));
    }

    #[tokio::test]
    async fn status_cell_first_value_wins() {
        let cell = StatusCell::new();
        cell.set("first");
        cell.set("second");
        assert_eq!(cell.waiter().wait().await, "first");
    }

    #[tokio::test]
    async fn status_cell_get_before_set() {
        let cell = StatusCell::<u32>::new();
        assert_eq!(cell.get(), None);
    }
}
