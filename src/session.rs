//! Live attacker sessions and their bookkeeping.

use crate::error::{DecoyError, DecoyResult};
use crate::sandbox::{SandboxManager, SandboxMount};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

/// A session that has not reached an interactive transport by then is orphaned.
pub const ORPHAN_GRACE: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    New,
    Negotiating,
    Active,
    Closed,
    Expired,
    Orphaned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    #[default]
    Shell,
    Exec,
    Subsystem,
}

/// Process-wide counters exposed to the stats API.
#[derive(Debug, Default)]
pub struct Stats {
    started: AtomicU64,
    removed: AtomicU64,
    wasted_ms: AtomicU64,
    uploads: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub sessions_started: u64,
    pub sessions_removed: u64,
    pub wasted_secs: u64,
    pub uploads: u64,
}

impl Stats {
    pub fn add_wasted(&self, gap: Duration) {
        self.wasted_ms.fetch_add(gap.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn wasted(&self) -> Duration {
        Duration::from_millis(self.wasted_ms.load(Ordering::Relaxed))
    }

    pub fn record_upload(&self) {
        self.uploads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            sessions_started: self.started.load(Ordering::Relaxed),
            sessions_removed: self.removed.load(Ordering::Relaxed),
            wasted_secs: self.wasted().as_secs(),
            uploads: self.uploads.load(Ordering::Relaxed),
        }
    }
}

/// Decides which peers are operator-trusted.
pub trait PeerTrust: Send + Sync {
    fn is_trusted(&self, host: &str) -> bool;
}

/// Static allow-list of hosts.
#[derive(Debug, Clone, Default)]
pub struct AllowList(HashSet<String>);

impl AllowList {
    pub fn new<I: IntoIterator<Item = String>>(hosts: I) -> Self {
        Self(hosts.into_iter().collect())
    }
}

impl PeerTrust for AllowList {
    fn is_trusted(&self, host: &str) -> bool {
        self.0.contains(host)
    }
}

/// Split `host:port` (IPv6 hosts may be bracketed).
pub fn parse_endpoint(id: &str) -> DecoyResult<(String, u16)> {
    let invalid = || DecoyError::SessionIdentity(id.to_string());
    let (host, port) = id.rsplit_once(':').ok_or_else(invalid)?;
    let host = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')).unwrap_or(host);
    if host.is_empty() {
        return Err(invalid());
    }
    let port = port.parse::<u16>().map_err(|_| invalid())?;
    Ok((host.to_string(), port))
}

#[derive(Debug)]
struct SessionState {
    phase: SessionPhase,
    last_activity: Instant,
    user: Option<String>,
    password: Option<String>,
    term: Option<String>,
    kind: SessionKind,
    orphan: bool,
    sandbox: Option<Arc<SandboxMount>>,
}

/// One attacker connection.
#[derive(Debug)]
pub struct Session {
    id: String,
    host: String,
    port: u16,
    created_at: Instant,
    whitelisted: bool,
    state: Mutex<SessionState>,
    closing: AtomicBool,
    close: Notify,
    stats: Arc<Stats>,
}

/// Serializable view of a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub user: Option<String>,
    pub term: Option<String>,
    pub kind: SessionKind,
    pub phase: SessionPhase,
    pub sandbox: Option<String>,
    pub age_secs: u64,
    pub idle_secs: u64,
    pub orphan: bool,
    pub whitelisted: bool,
}

impl Session {
    fn new(id: &str, host: String, port: u16, whitelisted: bool, stats: Arc<Stats>) -> Self {
        let now = Instant::now();
        Self {
            id: id.to_string(),
            host,
            port,
            created_at: now,
            whitelisted,
            state: Mutex::new(SessionState {
                phase: SessionPhase::New,
                last_activity: now,
                user: None,
                password: None,
                term: None,
                kind: SessionKind::default(),
                orphan: false,
                sandbox: None,
            }),
            closing: AtomicBool::new(false),
            close: Notify::new(),
            stats,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn whitelisted(&self) -> bool {
        self.whitelisted
    }

    pub fn phase(&self) -> SessionPhase {
        self.state.lock().phase
    }

    pub fn user(&self) -> Option<String> {
        self.state.lock().user.clone()
    }

    pub fn password(&self) -> Option<String> {
        self.state.lock().password.clone()
    }

    pub fn term(&self) -> Option<String> {
        self.state.lock().term.clone()
    }

    pub fn kind(&self) -> SessionKind {
        self.state.lock().kind
    }

    pub fn is_orphan(&self) -> bool {
        self.state.lock().orphan
    }

    pub fn last_activity(&self) -> Instant {
        self.state.lock().last_activity
    }

    fn transition(&self, f: impl FnOnce(&mut SessionState)) -> &Self {
        let now = Instant::now();
        {
            let mut state = self.state.lock();
            if state.phase == SessionPhase::New {
                state.phase = SessionPhase::Negotiating;
            }
            f(&mut state);
        }
        self.update_activity_at(now);
        self
    }

    pub fn negotiate_user(&self, user: &str) -> &Self {
        self.transition(|s| s.user = Some(user.to_string()))
    }

    pub fn set_password(&self, password: &str) -> &Self {
        self.transition(|s| s.password = Some(password.to_string()))
    }

    pub fn set_term(&self, term: &str) -> &Self {
        self.transition(|s| s.term = Some(term.to_string()))
    }

    pub fn set_kind(&self, kind: SessionKind) -> &Self {
        self.transition(|s| s.kind = kind)
    }

    /// The transport is usable; the session can no longer become an orphan.
    pub fn activate(&self) -> &Self {
        self.transition(|s| s.phase = SessionPhase::Active)
    }

    pub fn attach_sandbox(&self, mount: Arc<SandboxMount>) -> &Self {
        self.transition(|s| s.sandbox = Some(mount))
    }

    pub fn sandbox(&self) -> Option<Arc<SandboxMount>> {
        self.state.lock().sandbox.clone()
    }

    pub fn update_activity(&self) {
        self.update_activity_at(Instant::now());
    }

    /// Refresh the activity timestamp, crediting the gap to wasted time
    /// unless the session is an orphan.
    pub fn update_activity_at(&self, now: Instant) {
        let mut state = self.state.lock();
        if !state.orphan {
            self.stats.add_wasted(now.saturating_duration_since(state.last_activity));
        }
        state.last_activity = state.last_activity.max(now);
    }

    /// Ask the connection task to close the transport.
    pub fn request_close(&self) {
        self.closing.store(true, Ordering::SeqCst);
        self.close.notify_waiters();
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Resolves once [`request_close`](Session::request_close) has been
    /// called, including when that happened before this was polled. Every
    /// waiter wakes, so each channel of a connection sees the request.
    pub async fn close_requested(&self) {
        let notified = self.close.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_closing() {
            return;
        }
        notified.await;
    }

    pub fn info_at(&self, now: Instant) -> SessionInfo {
        let state = self.state.lock();
        SessionInfo {
            id: self.id.clone(),
            user: state.user.clone(),
            term: state.term.clone(),
            kind: state.kind,
            phase: state.phase,
            sandbox: state.sandbox.as_ref().map(|m| m.identity().to_string()),
            age_secs: now.saturating_duration_since(self.created_at).as_secs(),
            idle_secs: now.saturating_duration_since(state.last_activity).as_secs(),
            orphan: state.orphan,
            whitelisted: self.whitelisted,
        }
    }
}

/// What [`SessionRegistry::remove`] tore down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Removal {
    pub id: String,
    pub active_for: Duration,
    pub orphan: bool,
    pub reason: Option<String>,
}

/// Authoritative map of live sessions keyed by `host:port`.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    trust: Arc<dyn PeerTrust>,
    sandboxes: Arc<SandboxManager>,
    stats: Arc<Stats>,
    max_age: Duration,
}

impl SessionRegistry {
    pub fn new(trust: Arc<dyn PeerTrust>, sandboxes: Arc<SandboxManager>, max_age: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            trust,
            sandboxes,
            stats: Arc::new(Stats::default()),
            max_age,
        }
    }

    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    pub fn sandboxes(&self) -> &Arc<SandboxManager> {
        &self.sandboxes
    }

    /// Return the session for `endpoint`, creating it on first contact.
    pub async fn create(&self, endpoint: &str) -> DecoyResult<Arc<Session>> {
        let (host, port) = parse_endpoint(endpoint)?;
        let mut sessions = self.sessions.write().await;
        if let Some(existing) = sessions.get(endpoint) {
            return Ok(existing.clone());
        }

        let whitelisted = self.trust.is_trusted(&host);
        let session = Arc::new(Session::new(endpoint, host, port, whitelisted, self.stats.clone()));
        sessions.insert(endpoint.to_string(), session.clone());
        self.stats.started.fetch_add(1, Ordering::Relaxed);

        let host_sessions = sessions.values().filter(|s| s.host == session.host).count();
        info!(
            session = %endpoint,
            sessions = sessions.len(),
            host_sessions,
            whitelisted,
            "Session started"
        );
        Ok(session)
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    pub async fn list(&self) -> Vec<SessionInfo> {
        let now = Instant::now();
        let mut list: Vec<SessionInfo> = self
            .sessions
            .read()
            .await
            .values()
            .map(|s| s.info_at(now))
            .collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    pub async fn remove(&self, id: &str, reason: Option<&str>) -> Option<Removal> {
        self.remove_at(id, reason, Instant::now()).await
    }

    /// Tear down `id` if present. Orphans are credited with the time up to
    /// their last sign of life; everything else with its full uptime.
    pub async fn remove_at(&self, id: &str, reason: Option<&str>, now: Instant) -> Option<Removal> {
        let session = self.sessions.write().await.remove(id)?;

        let (orphan, active_for, sandbox) = {
            let mut state = session.state.lock();
            let active_for = if state.orphan {
                state.last_activity.saturating_duration_since(session.created_at)
            } else {
                now.saturating_duration_since(session.created_at)
            };
            if !matches!(state.phase, SessionPhase::Expired | SessionPhase::Orphaned) {
                state.phase = SessionPhase::Closed;
            }
            (state.orphan, active_for, state.sandbox.take())
        };
        if let Some(mount) = sandbox {
            self.sandboxes.deactivate(&mount).await;
        }
        self.stats.removed.fetch_add(1, Ordering::Relaxed);

        info!(
            session = %id,
            active_for_secs = active_for.as_secs(),
            orphan,
            reason = reason.unwrap_or(""),
            "Session removed"
        );
        Some(Removal {
            id: id.to_string(),
            active_for,
            orphan,
            reason: reason.map(str::to_string),
        })
    }

    /// Expire orphaned and idle sessions as of `now`.
    pub async fn sweep_at(&self, now: Instant) -> Vec<Removal> {
        let mut expired = Vec::new();
        for session in self.sessions.read().await.values() {
            let mut state = session.state.lock();
            if state.phase != SessionPhase::Active
                && now.saturating_duration_since(session.created_at) > ORPHAN_GRACE
            {
                state.orphan = true;
                state.phase = SessionPhase::Orphaned;
                drop(state);
                session.request_close();
                expired.push((session.id.clone(), "orphaned"));
            } else if now.saturating_duration_since(state.last_activity) > self.max_age {
                state.phase = SessionPhase::Expired;
                drop(state);
                session.request_close();
                expired.push((session.id.clone(), "idle timeout"));
            }
        }

        let mut removed = Vec::with_capacity(expired.len());
        for (id, reason) in expired {
            match self.remove_at(&id, Some(reason), now).await {
                Some(removal) => removed.push(removal),
                None => warn!(session = %id, "Session vanished during sweep"),
            }
        }
        removed
    }

    pub fn spawn_sweeper(self: Arc<Self>, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                ticker.tick().await;
                let removed = self.sweep_at(Instant::now()).await;
                if !removed.is_empty() {
                    debug!(count = removed.len(), "Session sweep removed sessions");
                }
            }
        })
    }
}
