use crate::{
    persist::SnapshotStore,
    session::{UserId, snapshot::SessionSnapshot},
};
use fnv::FnvHashMap;
use levelwatch_integration::channel::{Tx, UnboundedTx, mpsc_unbounded};
use std::{sync::Arc, time::Duration};
use tokio::{sync::oneshot, task::JoinHandle};
use tracing::{debug, error, warn};

/// Work submitted to the flush worker. Latest submission per user wins.
#[derive(Debug)]
enum FlushRequest {
    Save(Box<SessionSnapshot>),
    Delete(UserId),
    /// Move the stored blob aside for diagnosis (quarantine).
    Archive(UserId),
    /// Flush everything pending now and ack; used by graceful shutdown.
    FlushNow(oneshot::Sender<()>),
}

#[derive(Debug, Clone)]
struct FlushSendError;

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for FlushSendError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Self
    }
}

/// Handle through which session runners mark durable state dirty.
///
/// Submissions never block and never fail the foreground path: if the worker
/// is gone the loss is logged and the session continues in memory.
#[derive(Debug, Clone)]
pub struct FlushHandle {
    tx: UnboundedTx<FlushRequest, FlushSendError>,
}

impl FlushHandle {
    pub fn submit(&self, snapshot: SessionSnapshot) {
        if self.tx.send(FlushRequest::Save(Box::new(snapshot))).is_err() {
            warn!("flush worker gone; snapshot submission dropped");
        }
    }

    pub fn delete(&self, user_id: UserId) {
        if self.tx.send(FlushRequest::Delete(user_id)).is_err() {
            warn!("flush worker gone; snapshot delete dropped");
        }
    }

    pub fn archive(&self, user_id: UserId) {
        if self.tx.send(FlushRequest::Archive(user_id)).is_err() {
            warn!("flush worker gone; snapshot archive dropped");
        }
    }

    /// Force all pending snapshots to the store and wait for the ack.
    pub async fn flush_now(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(FlushRequest::FlushNow(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }
}

/// The single background writer: coalesces dirty snapshots per user and flushes
/// them with a maximum staleness of `interval`.
///
/// Store failures never propagate; the failed snapshot stays pending and is
/// retried on the next interval. A user crossing `failure_threshold`
/// consecutive failures is flagged for the operator, while their session keeps
/// mutating in memory.
#[derive(Debug)]
pub struct FlushWorker {
    store: Arc<dyn SnapshotStore>,
    interval: Duration,
    failure_threshold: u32,
}

impl FlushWorker {
    pub fn spawn(
        store: Arc<dyn SnapshotStore>,
        interval: Duration,
        failure_threshold: u32,
    ) -> (FlushHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc_unbounded();
        let worker = FlushWorker {
            store,
            interval,
            failure_threshold,
        };
        let task = tokio::spawn(worker.run(rx));
        (FlushHandle { tx }, task)
    }

    async fn run(
        self,
        mut rx: levelwatch_integration::channel::UnboundedRx<FlushRequest>,
    ) {
        let mut pending: FnvHashMap<UserId, Pending> = FnvHashMap::default();
        let mut failures: FnvHashMap<UserId, u32> = FnvHashMap::default();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                request = rx.recv() => match request {
                    Some(FlushRequest::Save(snapshot)) => {
                        pending.insert(snapshot.user_id.clone(), Pending::Save(snapshot));
                    }
                    Some(FlushRequest::Delete(user_id)) => {
                        pending.insert(user_id, Pending::Delete);
                    }
                    Some(FlushRequest::Archive(user_id)) => {
                        pending.insert(user_id, Pending::Archive);
                    }
                    Some(FlushRequest::FlushNow(ack)) => {
                        self.flush(&mut pending, &mut failures).await;
                        let _ = ack.send(());
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    self.flush(&mut pending, &mut failures).await;
                }
            }
        }

        // Producers are gone; push out whatever is left
        self.flush(&mut pending, &mut failures).await;
        debug!("flush worker stopped");
    }

    async fn flush(
        &self,
        pending: &mut FnvHashMap<UserId, Pending>,
        failures: &mut FnvHashMap<UserId, u32>,
    ) {
        let work: Vec<(UserId, Pending)> = pending.drain().collect();

        for (user_id, item) in work {
            let result = match &item {
                Pending::Save(snapshot) => match snapshot.encode() {
                    Ok(bytes) => self.store.save(&user_id, bytes).await,
                    Err(error) => {
                        // Unencodable state cannot be retried into existence
                        error!(user = %user_id, %error, "failed to encode snapshot, dropping");
                        continue;
                    }
                },
                Pending::Delete => self.store.delete(&user_id).await,
                Pending::Archive => self.store.archive(&user_id).await,
            };

            match result {
                Ok(()) => {
                    failures.remove(&user_id);
                }
                Err(error) => {
                    let count = failures.entry(user_id.clone()).or_insert(0);
                    *count += 1;
                    if *count == self.failure_threshold {
                        error!(
                            user = %user_id,
                            consecutive = *count,
                            %error,
                            "snapshot store failing persistently; session continues in memory only"
                        );
                    } else {
                        warn!(user = %user_id, consecutive = *count, %error, "snapshot flush failed, will retry");
                    }
                    // Retry the latest state on the next interval unless a
                    // newer submission already replaced it
                    pending.entry(user_id).or_insert(item);
                }
            }
        }
    }
}

#[derive(Debug)]
enum Pending {
    Save(Box<SessionSnapshot>),
    Delete,
    Archive,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        persist::memory::InMemorySnapshotStore,
        session::{SessionId, SessionState},
    };
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn snapshot(user: &str, balance: rust_decimal::Decimal) -> SessionSnapshot {
        let state = SessionState::new(
            SessionId::random(),
            UserId::new(user),
            None,
            balance,
            false,
            500,
        );
        SessionSnapshot::capture(&state, 100, Utc::now())
    }

    #[tokio::test(start_paused = true)]
    async fn test_submissions_coalesce_to_latest() {
        let store = Arc::new(InMemorySnapshotStore::new());
        let (handle, _task) =
            FlushWorker::spawn(store.clone(), Duration::from_secs(5), 3);

        handle.submit(snapshot("bhavesh", dec!(1)));
        handle.submit(snapshot("bhavesh", dec!(2)));
        handle.submit(snapshot("bhavesh", dec!(3)));
        handle.flush_now().await;

        let bytes = store.blob(&UserId::new("bhavesh")).unwrap();
        let decoded = SessionSnapshot::decode(&bytes).unwrap();
        assert_eq!(decoded.virtual_balance, dec!(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_flush_without_explicit_request() {
        let store = Arc::new(InMemorySnapshotStore::new());
        let (handle, _task) =
            FlushWorker::spawn(store.clone(), Duration::from_secs(5), 3);

        handle.submit(snapshot("bhavesh", dec!(42)));
        assert!(store.blob(&UserId::new("bhavesh")).is_none());

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(store.blob(&UserId::new("bhavesh")).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_failure_retries_latest_snapshot() {
        let store = Arc::new(InMemorySnapshotStore::new());
        let (handle, _task) =
            FlushWorker::spawn(store.clone(), Duration::from_secs(5), 3);

        store.set_failing(true);
        handle.submit(snapshot("bhavesh", dec!(1)));
        handle.flush_now().await;
        assert!(store.blob(&UserId::new("bhavesh")).is_none());

        // A newer submission supersedes the retained failed one
        handle.submit(snapshot("bhavesh", dec!(2)));
        store.set_failing(false);
        handle.flush_now().await;

        let bytes = store.blob(&UserId::new("bhavesh")).unwrap();
        assert_eq!(
            SessionSnapshot::decode(&bytes).unwrap().virtual_balance,
            dec!(2)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_supersedes_pending_save() {
        let store = Arc::new(InMemorySnapshotStore::new());
        let (handle, _task) =
            FlushWorker::spawn(store.clone(), Duration::from_secs(5), 3);

        handle.submit(snapshot("bhavesh", dec!(1)));
        handle.flush_now().await;
        assert!(store.blob(&UserId::new("bhavesh")).is_some());

        handle.submit(snapshot("bhavesh", dec!(2)));
        handle.delete(UserId::new("bhavesh"));
        handle.flush_now().await;
        assert!(store.blob(&UserId::new("bhavesh")).is_none());
    }
}
