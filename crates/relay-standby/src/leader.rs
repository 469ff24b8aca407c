//! Redis-based leader election.
//!
//! The lock is a single key holding the instance id, acquired with
//! `SET NX EX` and maintained by a watchdog firing every ttl/3. Refresh
//! and release go through Lua compare-and-set scripts so a paused former
//! leader can never rewrite a lock it no longer owns. A leader that loses
//! the lock and cannot reacquire it within one TTL transitions to
//! `Failed`; the embedding process exits non-zero so the orchestrator
//! reschedules it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{Result, StandbyError};

const REFRESH_SCRIPT: &str = r#"
    if redis.call("GET", KEYS[1]) == ARGV[1] then
        redis.call("EXPIRE", KEYS[1], ARGV[2])
        return 1
    else
        return 0
    end
"#;

const RELEASE_SCRIPT: &str = r#"
    if redis.call("GET", KEYS[1]) == ARGV[1] then
        redis.call("DEL", KEYS[1])
        return 1
    else
        return 0
    end
"#;

#[derive(Debug, Clone)]
pub struct LeaderElectionConfig {
    pub redis_url: String,
    pub lock_key: String,
    pub instance_id: String,
    pub lock_ttl_seconds: u64,
}

impl Default for LeaderElectionConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            lock_key: "relay:leader".to_string(),
            instance_id: Uuid::new_v4().to_string(),
            lock_ttl_seconds: 30,
        }
    }
}

impl LeaderElectionConfig {
    pub fn new(redis_url: String) -> Self {
        Self {
            redis_url,
            ..Default::default()
        }
    }

    pub fn with_lock_key(mut self, key: String) -> Self {
        self.lock_key = key;
        self
    }

    pub fn with_instance_id(mut self, id: String) -> Self {
        if !id.is_empty() {
            self.instance_id = id;
        }
        self
    }

    pub fn with_lock_ttl_seconds(mut self, ttl: u64) -> Self {
        self.lock_ttl_seconds = ttl.max(3);
        self
    }

    /// Watchdog cadence: a third of the TTL, so two refreshes can fail
    /// before the lock lapses.
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs((self.lock_ttl_seconds / 3).max(1))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeadershipStatus {
    /// This instance holds the lock and may consume.
    Leader,
    /// Another instance holds the lock.
    Follower,
    /// Held the lock, lost it, and could not reacquire within one TTL.
    /// The process should exit non-zero.
    Failed,
    /// Election has not settled yet.
    Unknown,
}

pub struct LeaderElection {
    config: LeaderElectionConfig,
    conn: ConnectionManager,
    is_leader: AtomicBool,
    running: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
    status_tx: watch::Sender<LeadershipStatus>,
    status_rx: watch::Receiver<LeadershipStatus>,
    /// When a former leader lost the lock; cleared on reacquisition.
    lost_at: Mutex<Option<Instant>>,
}

impl LeaderElection {
    pub async fn new(config: LeaderElectionConfig) -> Result<Self> {
        let client = redis::Client::open(config.redis_url.as_str())
            .map_err(|e| StandbyError::Connection(e.to_string()))?;
        let conn = ConnectionManager::new(client).await?;

        let (shutdown_tx, _) = broadcast::channel(1);
        let (status_tx, status_rx) = watch::channel(LeadershipStatus::Unknown);

        Ok(Self {
            config,
            conn,
            is_leader: AtomicBool::new(false),
            running: AtomicBool::new(false),
            shutdown_tx,
            status_tx,
            status_rx,
            lost_at: Mutex::new(None),
        })
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> LeadershipStatus {
        *self.status_rx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<LeadershipStatus> {
        self.status_rx.clone()
    }

    pub fn instance_id(&self) -> &str {
        &self.config.instance_id
    }

    /// Start the watchdog loop. The first tick runs immediately so a sole
    /// instance becomes leader without waiting a full interval.
    pub async fn start(self: Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(StandbyError::AlreadyRunning);
        }

        info!(
            instance_id = %self.config.instance_id,
            lock_key = %self.config.lock_key,
            ttl_seconds = self.config.lock_ttl_seconds,
            "Starting leader election"
        );

        let election = self.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(election.config.refresh_interval());
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        election.election_tick().await;
                        if election.status() == LeadershipStatus::Failed {
                            break;
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!(
                            instance_id = %election.config.instance_id,
                            "Leader election shutting down"
                        );
                        election.release_leadership().await;
                        break;
                    }
                }
            }
        });

        Ok(())
    }

    async fn election_tick(&self) {
        let mut conn = self.conn.clone();

        if self.is_leader() {
            match self.refresh_lease(&mut conn).await {
                Ok(true) => {
                    debug!(instance_id = %self.config.instance_id, "Lease refreshed");
                }
                Ok(false) => {
                    warn!(
                        instance_id = %self.config.instance_id,
                        "Lock taken over by another instance"
                    );
                    self.mark_lost();
                }
                Err(e) => {
                    error!(error = %e, "Lease refresh failed");
                    // A partitioned leader must assume the worst.
                    self.mark_lost();
                }
            }
            return;
        }

        match self.try_acquire(&mut conn).await {
            Ok(true) => {
                *self.lost_at.lock() = None;
                self.set_status(LeadershipStatus::Leader);
            }
            Ok(false) => {
                self.set_status(LeadershipStatus::Follower);
                self.check_reacquire_deadline();
            }
            Err(e) => {
                error!(error = %e, "Lock acquisition failed");
                self.check_reacquire_deadline();
            }
        }
    }

    async fn try_acquire(&self, conn: &mut ConnectionManager) -> Result<bool> {
        let result: Option<String> = redis::cmd("SET")
            .arg(&self.config.lock_key)
            .arg(&self.config.instance_id)
            .arg("NX")
            .arg("EX")
            .arg(self.config.lock_ttl_seconds)
            .query_async(conn)
            .await?;
        Ok(result.is_some())
    }

    async fn refresh_lease(&self, conn: &mut ConnectionManager) -> Result<bool> {
        let result: i32 = redis::Script::new(REFRESH_SCRIPT)
            .key(&self.config.lock_key)
            .arg(&self.config.instance_id)
            .arg(self.config.lock_ttl_seconds)
            .invoke_async(conn)
            .await?;
        Ok(result == 1)
    }

    /// Graceful release so a standby can take over immediately.
    async fn release_leadership(&self) {
        if !self.is_leader() {
            return;
        }

        let mut conn = self.conn.clone();
        match redis::Script::new(RELEASE_SCRIPT)
            .key(&self.config.lock_key)
            .arg(&self.config.instance_id)
            .invoke_async::<i32>(&mut conn)
            .await
        {
            Ok(1) => {
                info!(instance_id = %self.config.instance_id, "Released leadership lock");
            }
            Ok(_) => {
                debug!(instance_id = %self.config.instance_id, "Lock already gone at release");
            }
            Err(e) => {
                error!(error = %e, "Failed to release leadership lock");
            }
        }

        self.set_status(LeadershipStatus::Follower);
    }

    fn mark_lost(&self) {
        let mut lost_at = self.lost_at.lock();
        if lost_at.is_none() {
            *lost_at = Some(Instant::now());
        }
        drop(lost_at);
        self.set_status(LeadershipStatus::Follower);
    }

    /// A former leader that cannot get the lock back within one TTL gives
    /// up entirely; the orchestrator restarts the process clean.
    fn check_reacquire_deadline(&self) {
        let lost_at = *self.lost_at.lock();
        if let Some(lost) = lost_at {
            if lost.elapsed() >= Duration::from_secs(self.config.lock_ttl_seconds) {
                error!(
                    instance_id = %self.config.instance_id,
                    ttl_seconds = self.config.lock_ttl_seconds,
                    "Could not reacquire leadership within one TTL - failing"
                );
                self.set_status(LeadershipStatus::Failed);
            }
        }
    }

    fn set_status(&self, status: LeadershipStatus) {
        let was_leader = self.is_leader.load(Ordering::SeqCst);
        let is_now_leader = status == LeadershipStatus::Leader;
        self.is_leader.store(is_now_leader, Ordering::SeqCst);
        let _ = self.status_tx.send(status);

        if was_leader != is_now_leader {
            if is_now_leader {
                info!(instance_id = %self.config.instance_id, "Became leader");
            } else {
                info!(instance_id = %self.config.instance_id, "No longer leader");
            }
        }
    }

    pub async fn shutdown(&self) {
        info!(instance_id = %self.config.instance_id, "Stopping leader election");
        self.running.store(false, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());
    }
}

/// Gate consumers check before starting. With standby disabled it is
/// always open.
pub struct StandbyGate {
    election: Option<Arc<LeaderElection>>,
}

impl StandbyGate {
    pub fn disabled() -> Self {
        Self { election: None }
    }

    pub fn new(election: Arc<LeaderElection>) -> Self {
        Self {
            election: Some(election),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.election.is_some()
    }

    /// Whether this instance may consume right now.
    pub fn should_consume(&self) -> bool {
        match &self.election {
            Some(election) => election.is_leader(),
            None => true,
        }
    }

    pub fn status(&self) -> LeadershipStatus {
        match &self.election {
            Some(election) => election.status(),
            None => LeadershipStatus::Leader,
        }
    }

    pub fn subscribe(&self) -> Option<watch::Receiver<LeadershipStatus>> {
        self.election.as_ref().map(|e| e.subscribe())
    }

    /// Block until this instance is primary (or fail-fast on `Failed`).
    /// Immediate with standby disabled.
    pub async fn wait_for_leadership(&self) -> LeadershipStatus {
        let Some(ref election) = self.election else {
            return LeadershipStatus::Leader;
        };

        let mut rx = election.subscribe();
        loop {
            let status = *rx.borrow();
            match status {
                LeadershipStatus::Leader | LeadershipStatus::Failed => return status,
                _ => {}
            }
            if rx.changed().await.is_err() {
                return *rx.borrow();
            }
        }
    }
}
