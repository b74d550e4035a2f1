use crate::{
    channel::protocol::{ServerMessage, close_code},
    clock::Clock,
};
use fnv::FnvHashMap;
use levelwatch_integration::channel::{BoundedTx, TrySendError, Tx, mpsc_bounded};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::{sync::Notify, task::JoinHandle};
use tracing::{debug, warn};

/// Identity of one downstream channel, unique for the process lifetime.
///
/// A session compares the id carried by `UnbindChannel` against its bound
/// channel so a stale unbind from a superseded channel is ignored.
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize,
)]
#[serde(transparent)]
pub struct ChannelId(pub u64);

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Producer-side handle to one client channel: enqueue frames, or signal the
/// writer to close with a code.
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    pub id: ChannelId,
    tx: BoundedTx<ServerMessage>,
    closer: ChannelCloser,
}

impl ChannelHandle {
    /// Enqueue a frame. Never waits; a full queue is the caller's signal to
    /// apply the slow-consumer policy.
    pub fn send(&self, message: ServerMessage) -> Result<(), TrySendError> {
        self.tx.send(message)
    }

    /// Ask the writer task to close the channel with `code`.
    pub fn close(&self, code: u16) {
        self.closer.close(code);
    }

    pub fn closer(&self) -> ChannelCloser {
        self.closer.clone()
    }
}

/// Shared close signal between producers and the channel's writer task.
#[derive(Debug, Clone, Default)]
pub struct ChannelCloser {
    shared: Arc<CloseShared>,
}

#[derive(Debug, Default)]
struct CloseShared {
    code: Mutex<Option<u16>>,
    notify: Notify,
}

impl ChannelCloser {
    /// First close wins; later codes are ignored.
    pub fn close(&self, code: u16) {
        let mut slot = self.shared.code.lock();
        if slot.is_none() {
            *slot = Some(code);
        }
        drop(slot);
        self.shared.notify.notify_waiters();
    }

    pub fn code(&self) -> Option<u16> {
        *self.shared.code.lock()
    }

    /// Wait until a close is requested.
    pub async fn closed(&self) -> u16 {
        loop {
            // Register interest before checking, so a close between the check
            // and the await cannot be missed
            let notified = self.shared.notify.notified();
            if let Some(code) = self.code() {
                return code;
            }
            notified.await;
        }
    }
}

/// Registry of live downstream channels.
///
/// Channel IO is owned by per-channel reader/writer tasks; the manager only
/// tracks handles so the single heartbeat task can reach every live queue.
#[derive(Debug, Default)]
pub struct ChannelManager {
    channels: Mutex<FnvHashMap<ChannelId, ChannelHandle>>,
    next_id: AtomicU64,
}

impl ChannelManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and register a channel with a send queue bound of `capacity`.
    /// Returns the producer handle and the writer task's receiver.
    pub fn open(
        self: &Arc<Self>,
        capacity: usize,
    ) -> (ChannelHandle, tokio::sync::mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc_bounded(capacity);
        let handle = ChannelHandle {
            id: ChannelId(self.next_id.fetch_add(1, Ordering::Relaxed)),
            tx,
            closer: ChannelCloser::default(),
        };
        self.channels.lock().insert(handle.id, handle.clone());
        (handle, rx)
    }

    /// Drop a channel from the registry once its writer task exits.
    pub fn remove(&self, id: ChannelId) {
        if self.channels.lock().remove(&id).is_some() {
            debug!(channel = %id, "channel deregistered");
        }
    }

    pub fn len(&self) -> usize {
        self.channels.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.lock().is_empty()
    }

    /// Enqueue a heartbeat into every live channel. A channel whose queue is
    /// full is closed with the slow-consumer code.
    pub fn broadcast_heartbeat(&self, ts: chrono::DateTime<chrono::Utc>) {
        let channels: Vec<ChannelHandle> = self.channels.lock().values().cloned().collect();
        for channel in channels {
            match channel.send(ServerMessage::Heartbeat { ts }) {
                Ok(()) => {}
                Err(TrySendError::Full) => {
                    warn!(channel = %channel.id, "send queue overflow, closing slow consumer");
                    channel.close(close_code::SLOW_CONSUMER);
                }
                Err(TrySendError::Closed) => {
                    self.remove(channel.id);
                }
            }
        }
    }

    /// Ask every live channel's writer to close with `code`, preceded by a
    /// `status` notice where the queue still has room.
    pub fn close_all(&self, code: u16) {
        let channels: Vec<ChannelHandle> = self.channels.lock().values().cloned().collect();
        for channel in channels {
            let _ = channel.send(ServerMessage::Status {
                message: "server shutting down".to_string(),
            });
            channel.close(code);
        }
    }
}

/// The single downstream liveness task: one `heartbeat` frame per channel per
/// interval, nothing else in the system owns a liveness timer.
pub fn spawn_heartbeat(
    manager: Arc<ChannelManager>,
    clock: Arc<dyn Clock>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick completes immediately; skip it so a fresh channel is
        // not greeted with a heartbeat before `connected`
        ticker.tick().await;
        loop {
            ticker.tick().await;
            manager.broadcast_heartbeat(clock.now_wall());
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_slow_consumer_is_closed_on_heartbeat_overflow() {
        let manager = Arc::new(ChannelManager::new());
        let (handle, mut rx) = manager.open(2);

        manager.broadcast_heartbeat(Utc::now());
        manager.broadcast_heartbeat(Utc::now());
        assert!(handle.closer().code().is_none());

        // Third heartbeat overflows the bound of 2
        manager.broadcast_heartbeat(Utc::now());
        assert_eq!(handle.closer().code(), Some(close_code::SLOW_CONSUMER));

        // Queued frames are still drainable; no state was lost
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_first_close_code_wins() {
        let closer = ChannelCloser::default();
        closer.close(close_code::SLOW_CONSUMER);
        closer.close(close_code::NORMAL);
        assert_eq!(closer.code(), Some(close_code::SLOW_CONSUMER));
    }

    #[tokio::test]
    async fn test_closed_wakes_waiter() {
        let closer = ChannelCloser::default();
        let waiter = closer.clone();
        let task = tokio::spawn(async move { waiter.closed().await });
        tokio::task::yield_now().await;

        closer.close(close_code::SEND_DEADLINE);
        assert_eq!(task.await.unwrap(), close_code::SEND_DEADLINE);
    }

    #[test]
    fn test_open_and_remove_track_registry() {
        let manager = Arc::new(ChannelManager::new());
        let (a, _rx_a) = manager.open(4);
        let (b, _rx_b) = manager.open(4);
        assert_eq!(manager.len(), 2);
        assert_ne!(a.id, b.id);

        manager.remove(a.id);
        assert_eq!(manager.len(), 1);
    }
}
