use crate::{
    persist::{PersistError, SnapshotStore},
    session::{
        SessionId, SessionState, UserId,
        command::{Command, CommandError, Replier, SessionError},
        runner::{SessionDeps, SessionRunner},
        snapshot::SessionSnapshot,
    },
};
use chrono::{DateTime, TimeDelta, Utc};
use fnv::FnvHashMap;
use levelwatch_feed::BrokerCredentials;
use levelwatch_integration::channel::{BoundedTx, TrySendError, Tx, conflating, mpsc_bounded};
use parking_lot::Mutex;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{sync::oneshot, task::JoinHandle};
use tracing::{info, warn};

/// Cloneable address of one session's command loop.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub session_id: SessionId,
    pub user_id: UserId,
    cmd: BoundedTx<Command>,
}

impl SessionHandle {
    /// Enqueue a command without waiting. Overflow policy belongs to the
    /// producer: HTTP surfaces a retriable error, channel readers emit a
    /// `status` frame, timers simply drop.
    pub fn try_send(&self, command: Command) -> Result<(), CommandError> {
        self.cmd.send(command).map_err(|error| match error {
            TrySendError::Full => CommandError::QueueFull,
            TrySendError::Closed => CommandError::SessionGone,
        })
    }

    /// Submit a command built around a fresh reply slot and await the verdict.
    pub async fn request<T>(
        &self,
        make: impl FnOnce(Replier<T>) -> Command,
    ) -> Result<Result<T, SessionError>, CommandError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.try_send(make(reply_tx))?;
        reply_rx.await.map_err(|_| CommandError::ReplyDropped)
    }
}

/// Failures locating or rebuilding a session for a channel bind / HTTP call.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("no session for the presented identity")]
    NotFound,

    #[error("snapshot rejected: {0}")]
    Snapshot(#[from] PersistError),
}

/// Owner of every session: primary index by `session_id`, secondary by
/// `user_id`, rehydrate-on-miss from the snapshot store.
#[derive(Debug)]
pub struct SessionRegistry {
    inner: Mutex<Inner>,
    deps: SessionDeps,
    store: Arc<dyn SnapshotStore>,
}

#[derive(Debug, Default)]
struct Inner {
    by_session: FnvHashMap<SessionId, Entry>,
    by_user: FnvHashMap<UserId, SessionId>,
}

#[derive(Debug)]
struct Entry {
    handle: SessionHandle,
    last_seen: DateTime<Utc>,
    task: JoinHandle<()>,
}

impl SessionRegistry {
    pub fn new(deps: SessionDeps, store: Arc<dyn SnapshotStore>) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner::default()),
            deps,
            store,
        })
    }

    /// Create (or re-enter) the session for `user_id`.
    ///
    /// Login is idempotent per user: a live session is reused, refreshed with
    /// the new broker credentials; otherwise the durable snapshot is consulted
    /// before starting from scratch.
    pub async fn login(
        &self,
        user_id: UserId,
        credentials: Option<BrokerCredentials>,
    ) -> SessionHandle {
        if let Some(credentials) = &credentials {
            self.deps.feed.add_credentials(credentials.clone());
        }

        if let Some(handle) = self.lookup_user(&user_id) {
            return handle;
        }

        match self.rehydrate(&user_id).await {
            Ok(handle) => handle,
            Err(ResolveError::NotFound) => self.spawn_fresh(user_id, credentials),
            Err(ResolveError::Snapshot(error)) => {
                warn!(user = %user_id, %error, "snapshot unusable at login; starting fresh");
                self.spawn_fresh(user_id, credentials)
            }
        }
    }

    /// Primary lookup, touching the warm TTL.
    pub fn get(&self, session_id: SessionId) -> Option<SessionHandle> {
        let mut inner = self.inner.lock();
        let entry = inner.by_session.get_mut(&session_id)?;
        entry.last_seen = Utc::now();
        Some(entry.handle.clone())
    }

    /// Locate a session for a channel bind: by `session_id`, else by live
    /// `user_id`, else by rehydrating the snapshot under a fresh `session_id`.
    pub async fn resolve(
        &self,
        session_id: SessionId,
        user_id: Option<&UserId>,
    ) -> Result<SessionHandle, ResolveError> {
        if let Some(handle) = self.get(session_id) {
            return Ok(handle);
        }

        let Some(user_id) = user_id else {
            return Err(ResolveError::NotFound);
        };

        if let Some(handle) = self.lookup_user(user_id) {
            return Ok(handle);
        }

        self.rehydrate(user_id).await
    }

    /// Explicit logout: stop the loop, drop the indexes, discard the snapshot.
    pub async fn logout(&self, session_id: SessionId) -> bool {
        let Some(entry) = self.remove_entry(session_id) else {
            return false;
        };

        shutdown_entry(&entry, Duration::from_secs(5)).await;
        self.deps.flush.delete(entry.handle.user_id.clone());
        info!(session = %session_id, user = %entry.handle.user_id, "session logged out");
        true
    }

    /// Graceful shutdown: drain every loop (bounded) and force a final flush.
    pub async fn shutdown_all(&self, drain_deadline: Duration) {
        let entries: Vec<Entry> = {
            let mut inner = self.inner.lock();
            inner.by_user.clear();
            inner.by_session.drain().map(|(_, entry)| entry).collect()
        };

        info!(sessions = entries.len(), "draining session loops");
        for entry in &entries {
            shutdown_entry(entry, drain_deadline).await;
        }
        self.deps.flush.flush_now().await;
    }

    /// Evict sessions idle past the warm TTL. Their snapshots stay on disk
    /// until the cold TTL rejects them at rehydrate.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        let interval = Duration::from_secs(registry.deps.config.session.sweep_interval_secs);
        let warm_ttl = TimeDelta::seconds(registry.deps.config.session.ttl_warm_secs as i64);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let now = Utc::now();
                let stale: Vec<SessionId> = {
                    let inner = registry.inner.lock();
                    inner
                        .by_session
                        .iter()
                        .filter(|(_, entry)| now - entry.last_seen > warm_ttl)
                        .map(|(id, _)| *id)
                        .collect()
                };

                for session_id in stale {
                    if let Some(entry) = registry.remove_entry(session_id) {
                        info!(session = %session_id, user = %entry.handle.user_id, "warm TTL evicting idle session");
                        shutdown_entry(&entry, Duration::from_secs(5)).await;
                    }
                }
            }
        })
    }

    /// Periodically nudge every loop to run its square-off check, so open
    /// trades close inside the window even on silent instruments.
    pub fn spawn_square_off_timer(self: &Arc<Self>) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        let interval = Duration::from_secs(registry.deps.config.session.square_off_poll_secs);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let handles: Vec<SessionHandle> = {
                    let inner = registry.inner.lock();
                    inner
                        .by_session
                        .values()
                        .map(|entry| entry.handle.clone())
                        .collect()
                };
                for handle in handles {
                    // Timer probes are droppable under pressure
                    let _ = handle.try_send(Command::SquareOffCheck);
                }
            }
        })
    }

    pub fn session_count(&self) -> usize {
        self.inner.lock().by_session.len()
    }

    fn lookup_user(&self, user_id: &UserId) -> Option<SessionHandle> {
        let mut inner = self.inner.lock();
        let session_id = *inner.by_user.get(user_id)?;
        let entry = inner.by_session.get_mut(&session_id)?;
        entry.last_seen = Utc::now();
        Some(entry.handle.clone())
    }

    fn spawn_fresh(&self, user_id: UserId, credentials: Option<BrokerCredentials>) -> SessionHandle {
        let config = &self.deps.config;
        let state = SessionState::new(
            SessionId::random(),
            user_id,
            credentials,
            config.paper.starting_balance,
            config.paper.allow_averaging,
            config.session.alert_log_cap,
        );
        self.spawn_session(state)
    }

    /// Load, validate and start a session from its durable snapshot.
    async fn rehydrate(&self, user_id: &UserId) -> Result<SessionHandle, ResolveError> {
        let Some(bytes) = self.store.load(user_id).await? else {
            return Err(ResolveError::NotFound);
        };

        let snapshot = match SessionSnapshot::decode(&bytes) {
            Ok(snapshot) => snapshot,
            Err(error) => {
                // Archive the corrupt blob for diagnosis and refuse the bind
                warn!(user = %user_id, %error, "corrupt snapshot archived");
                if let Err(archive_error) = self.store.archive(user_id).await {
                    warn!(user = %user_id, %archive_error, "failed to archive corrupt snapshot");
                }
                return Err(ResolveError::Snapshot(error));
            }
        };

        let cold_ttl = TimeDelta::seconds(self.deps.config.session.ttl_cold_secs as i64);
        if Utc::now() - snapshot.updated_at > cold_ttl {
            info!(user = %user_id, "cold TTL discarding stale snapshot");
            self.deps.flush.delete(user_id.clone());
            return Err(ResolveError::NotFound);
        }

        if let Some(credentials) = &snapshot.credentials {
            self.deps.feed.add_credentials(credentials.clone());
        }

        let state = snapshot.restore(
            SessionId::random(),
            self.deps.config.session.alert_log_cap,
        );
        info!(user = %user_id, session = %state.session_id, "session rehydrated from snapshot");
        Ok(self.spawn_session(state))
    }

    /// Wire a state into a running loop: command queue, tick mailbox, feed
    /// registration and the watchlist's initial subscribe delta.
    fn spawn_session(&self, state: SessionState) -> SessionHandle {
        let session_id = state.session_id;
        let user_id = state.user_id.clone();
        let config = &self.deps.config;

        let (cmd_tx, cmd_rx) = mpsc_bounded(config.session.command_queue);
        let (tick_tx, tick_rx) = conflating();

        self.deps.feed.register(session_id, tick_tx);
        let watched = state.watched_markets();
        if !watched.is_empty() {
            self.deps.feed.subscribe(session_id, &watched);
        }

        let runner = SessionRunner::new(state, self.deps.clone());
        let task = tokio::spawn(runner.run(cmd_rx, tick_rx));

        let handle = SessionHandle {
            session_id,
            user_id: user_id.clone(),
            cmd: cmd_tx,
        };

        let mut inner = self.inner.lock();
        if let Some(previous) = inner.by_user.insert(user_id, session_id)
            && let Some(entry) = inner.by_session.remove(&previous)
        {
            // A fresh spawn superseded a live session for the same user; let
            // the old loop drain on its own
            let (ack_tx, _ack_rx) = oneshot::channel();
            if entry.handle.try_send(Command::Shutdown { ack: ack_tx }).is_err() {
                entry.task.abort();
            }
        }
        inner.by_session.insert(
            session_id,
            Entry {
                handle: handle.clone(),
                last_seen: Utc::now(),
                task,
            },
        );
        drop(inner);

        info!(session = %session_id, "session spawned");
        handle
    }

    fn remove_entry(&self, session_id: SessionId) -> Option<Entry> {
        let mut inner = self.inner.lock();
        let entry = inner.by_session.remove(&session_id)?;
        inner.by_user.remove(&entry.handle.user_id);
        Some(entry)
    }
}

async fn shutdown_entry(entry: &Entry, deadline: Duration) {
    let (ack_tx, ack_rx) = oneshot::channel();
    match entry.handle.try_send(Command::Shutdown { ack: ack_tx }) {
        Ok(()) => {
            if tokio::time::timeout(deadline, ack_rx).await.is_err() {
                warn!(session = %entry.handle.session_id, "session loop missed drain deadline, aborting");
                entry.task.abort();
            }
        }
        Err(_) => entry.task.abort(),
    }
}
