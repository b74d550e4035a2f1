use derive_more::Constructor;
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::{hash::Hash, marker::PhantomData, sync::Arc};
use tokio::sync::Notify;

/// Transmitter half of a channel between two server tasks.
///
/// Implementations must be cheap to `Clone` so producers can be handed out
/// freely (request handlers, timers, the feed dispatcher).
pub trait Tx
where
    Self: Clone + Send,
{
    type Item;
    type Error;
    fn send(&self, item: Self::Item) -> Result<(), Self::Error>;
}

/// [`Tx`] backed by an unbounded `tokio` mpsc channel.
///
/// Reserved for control-plane traffic that must never be dropped (persistence
/// submissions, shutdown signals). Data-plane traffic uses [`BoundedTx`].
#[derive(Debug)]
pub struct UnboundedTx<T, Error> {
    pub tx: tokio::sync::mpsc::UnboundedSender<T>,
    phantom: PhantomData<Error>,
}

impl<T, Error> UnboundedTx<T, Error> {
    pub fn new(tx: tokio::sync::mpsc::UnboundedSender<T>) -> Self {
        Self {
            tx,
            phantom: PhantomData,
        }
    }
}

impl<T, Error> Clone for UnboundedTx<T, Error> {
    fn clone(&self) -> Self {
        Self::new(self.tx.clone())
    }
}

impl<T, Error> Tx for UnboundedTx<T, Error>
where
    T: Send,
    Error: From<tokio::sync::mpsc::error::SendError<T>> + Send,
{
    type Item = T;
    type Error = Error;

    fn send(&self, item: Self::Item) -> Result<(), Self::Error> {
        self.tx.send(item).map_err(Error::from)
    }
}

/// [`Tx`] backed by a bounded `tokio` mpsc channel.
///
/// `send` never waits: a full queue surfaces [`TrySendError`] immediately so the
/// producer can apply its overflow policy (fail the request, close the channel,
/// emit a status frame).
#[derive(Debug)]
pub struct BoundedTx<T> {
    pub tx: tokio::sync::mpsc::Sender<T>,
}

impl<T> BoundedTx<T> {
    pub fn new(tx: tokio::sync::mpsc::Sender<T>) -> Self {
        Self { tx }
    }

    /// Capacity remaining before `send` starts returning [`TrySendError::Full`].
    pub fn capacity(&self) -> usize {
        self.tx.capacity()
    }
}

impl<T> Clone for BoundedTx<T> {
    fn clone(&self) -> Self {
        Self::new(self.tx.clone())
    }
}

impl<T> Tx for BoundedTx<T>
where
    T: Send,
{
    type Item = T;
    type Error = TrySendError;

    fn send(&self, item: Self::Item) -> Result<(), Self::Error> {
        self.tx.try_send(item).map_err(|error| match error {
            tokio::sync::mpsc::error::TrySendError::Full(_) => TrySendError::Full,
            tokio::sync::mpsc::error::TrySendError::Closed(_) => TrySendError::Closed,
        })
    }
}

/// Error returned by [`BoundedTx::send`] when the queue is full or the consumer
/// has gone away.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum TrySendError {
    #[error("bounded channel is full")]
    Full,
    #[error("bounded channel is closed")]
    Closed,
}

/// Construct an unbounded channel pair wrapped in [`UnboundedTx`] / [`UnboundedRx`].
pub fn mpsc_unbounded<T, Error>() -> (UnboundedTx<T, Error>, UnboundedRx<T>) {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    (UnboundedTx::new(tx), UnboundedRx::new(rx))
}

/// Construct a bounded channel pair wrapped in [`BoundedTx`].
pub fn mpsc_bounded<T>(capacity: usize) -> (BoundedTx<T>, tokio::sync::mpsc::Receiver<T>) {
    let (tx, rx) = tokio::sync::mpsc::channel(capacity);
    (BoundedTx::new(tx), rx)
}

/// Receiver half of an [`UnboundedTx`] channel.
#[derive(Debug, Constructor)]
pub struct UnboundedRx<T> {
    pub rx: tokio::sync::mpsc::UnboundedReceiver<T>,
}

impl<T> UnboundedRx<T> {
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }
}

/// Conflating latest-value mailbox keyed by `Key`.
///
/// A `send` for a key that already holds an undelivered value overwrites it, so
/// a slow consumer always observes the newest value per key and never a backlog.
/// Keys drain in the order they first became pending.
#[derive(Debug)]
pub struct ConflatingTx<Key, Item> {
    shared: Arc<ConflatingShared<Key, Item>>,
}

impl<Key, Item> Clone for ConflatingTx<Key, Item> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Consumer half of a [`ConflatingTx`] mailbox.
#[derive(Debug)]
pub struct ConflatingRx<Key, Item> {
    shared: Arc<ConflatingShared<Key, Item>>,
}

#[derive(Debug)]
struct ConflatingShared<Key, Item> {
    slots: Mutex<IndexMap<Key, Item>>,
    notify: Notify,
}

/// Construct a conflating mailbox pair.
pub fn conflating<Key, Item>() -> (ConflatingTx<Key, Item>, ConflatingRx<Key, Item>)
where
    Key: Hash + Eq,
{
    let shared = Arc::new(ConflatingShared {
        slots: Mutex::new(IndexMap::new()),
        notify: Notify::new(),
    });

    (
        ConflatingTx {
            shared: Arc::clone(&shared),
        },
        ConflatingRx { shared },
    )
}

impl<Key, Item> ConflatingTx<Key, Item>
where
    Key: Hash + Eq,
{
    /// Insert the latest `item` for `key`, overwriting any undelivered value.
    pub fn send(&self, key: Key, item: Item) {
        self.shared.slots.lock().insert(key, item);
        self.shared.notify.notify_one();
    }
}

impl<Key, Item> ConflatingRx<Key, Item>
where
    Key: Hash + Eq,
{
    /// Take the oldest pending `(key, item)` pair without waiting.
    pub fn try_recv(&mut self) -> Option<(Key, Item)> {
        self.shared.slots.lock().shift_remove_index(0)
    }

    /// Wait for the next pending `(key, item)` pair.
    pub async fn recv(&mut self) -> (Key, Item) {
        loop {
            if let Some(entry) = self.try_recv() {
                return entry;
            }
            self.shared.notify.notified().await;
        }
    }

    /// Number of keys with an undelivered value.
    pub fn len(&self) -> usize {
        self.shared.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.slots.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounded_tx_overflow() {
        let (tx, mut rx) = mpsc_bounded::<u8>(2);
        assert_eq!(tx.send(1), Ok(()));
        assert_eq!(tx.send(2), Ok(()));
        assert_eq!(tx.send(3), Err(TrySendError::Full));

        assert_eq!(rx.try_recv().ok(), Some(1));
        assert_eq!(tx.send(3), Ok(()));

        drop(rx);
        assert_eq!(tx.send(4), Err(TrySendError::Closed));
    }

    #[test]
    fn test_conflating_mailbox_overwrites_per_key() {
        let (tx, mut rx) = conflating::<u32, u64>();

        tx.send(2885, 1);
        tx.send(2885, 2);
        tx.send(2885, 3);
        tx.send(11536, 10);

        assert_eq!(rx.len(), 2);
        assert_eq!(rx.try_recv(), Some((2885, 3)));
        assert_eq!(rx.try_recv(), Some((11536, 10)));
        assert_eq!(rx.try_recv(), None);
    }

    #[tokio::test]
    async fn test_conflating_mailbox_wakes_consumer() {
        let (tx, mut rx) = conflating::<u32, u64>();

        let consumer = tokio::spawn(async move { rx.recv().await });
        tokio::task::yield_now().await;
        tx.send(2885, 42);

        let received = consumer.await.unwrap();
        assert_eq!(received, (2885, 42));
    }
}
