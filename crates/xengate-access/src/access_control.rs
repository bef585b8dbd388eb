//! Per-IP daily time quotas
//!
//! Every rule binds one source address to a daily budget of forwarding
//! time. Time is accounted while at least one session from that address is
//! active; once the budget is spent the address is refused until the next
//! local midnight. Master rules are exempt from accounting and blocking.
//! Addresses without a rule are always admitted.

use chrono::{DateTime, Local, TimeZone, Utc};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock, RwLockWriteGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use xengate_proto::{ConfigError, ConfigStore, RuleRecord};

/// Budget applied to rules that carry no limit
pub const DEFAULT_DAILY_LIMIT: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Error)]
pub enum AccessError {
    #[error("Rule not found: {0}")]
    RuleNotFound(String),

    #[error("IP {ip} is already bound to rule {rule_id}")]
    DuplicateIp { ip: IpAddr, rule_id: String },

    #[error("Failed to persist rules: {0}")]
    Persistence(#[from] ConfigError),
}

/// Quota rule for one source address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessRule {
    pub id: String,
    pub title: String,
    pub ip: IpAddr,
    pub is_master: bool,
    pub daily_limit: Duration,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Usage accounting for one rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessStatus {
    pub rule_id: String,
    pub used_time: Duration,
    pub blocked: bool,
    pub last_access: Option<DateTime<Utc>>,
    pub reset_time: DateTime<Utc>,
    /// Start of the current accounting window, set while sessions are open
    pub active_since: Option<DateTime<Utc>>,
    pub active_sessions: u32,
}

impl AccessStatus {
    fn fresh(rule_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            rule_id: rule_id.to_string(),
            used_time: Duration::ZERO,
            blocked: false,
            last_access: None,
            reset_time: now,
            active_since: None,
            active_sessions: 0,
        }
    }

    fn reset(&mut self, now: DateTime<Utc>) {
        self.used_time = Duration::ZERO;
        self.blocked = false;
        self.reset_time = now;
        // An open window restarts so time before the reset is not billed.
        // A window with no open session left is dropped.
        self.active_since = match self.active_since {
            Some(_) if self.active_sessions > 0 => Some(now),
            _ => None,
        };
    }
}

/// Fields supplied when creating or replacing a rule
#[derive(Debug, Clone)]
pub struct NewRule {
    pub title: String,
    pub ip: IpAddr,
    pub is_master: bool,
    pub daily_limit: Duration,
    pub description: String,
}

#[derive(Debug, Default)]
struct AccessState {
    rules: HashMap<String, AccessRule>,
    by_ip: HashMap<IpAddr, String>,
    status: HashMap<String, AccessStatus>,
}

impl AccessState {
    fn from_records(records: Vec<RuleRecord>, now: DateTime<Local>) -> Self {
        let mut state = Self::default();
        let now_utc = now.with_timezone(&Utc);
        let today = now.date_naive();

        for record in records {
            let daily_limit = effective_limit(Duration::from_secs(record.daily_limit_secs));

            let mut status = AccessStatus::fresh(&record.id, now_utc);
            status.last_access = record.last_access;

            // Usage recorded on an earlier day has already expired
            let stale = record
                .last_access
                .map(|at| at.with_timezone(&Local).date_naive() < today)
                .unwrap_or(true);
            if !record.is_master && !stale {
                status.used_time = Duration::from_secs(record.used_time_secs);
                status.blocked = record.is_blocked || status.used_time >= daily_limit;
            }

            let rule = AccessRule {
                id: record.id,
                title: record.title,
                ip: record.ip,
                is_master: record.is_master,
                daily_limit,
                description: record.description,
                created_at: record.created_at,
                updated_at: record.updated_at,
            };

            state.by_ip.insert(rule.ip, rule.id.clone());
            state.status.insert(rule.id.clone(), status);
            state.rules.insert(rule.id.clone(), rule);
        }

        state
    }

    fn to_records(&self) -> Vec<RuleRecord> {
        let mut records: Vec<RuleRecord> = self
            .rules
            .values()
            .map(|rule| {
                let status = self.status.get(&rule.id);
                RuleRecord {
                    id: rule.id.clone(),
                    title: rule.title.clone(),
                    ip: rule.ip,
                    is_master: rule.is_master,
                    daily_limit_secs: rule.daily_limit.as_secs(),
                    description: rule.description.clone(),
                    created_at: rule.created_at,
                    updated_at: rule.updated_at,
                    last_access: status.and_then(|s| s.last_access),
                    used_time_secs: status.map(|s| s.used_time.as_secs()).unwrap_or(0),
                    is_blocked: status.map(|s| s.blocked).unwrap_or(false),
                }
            })
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        records
    }

    /// Count a new session against `ip`. Returns the metered rule, if any.
    fn admit(&mut self, ip: IpAddr, now: DateTime<Utc>) -> Admission {
        let Some(rule_id) = self.by_ip.get(&ip).cloned() else {
            return Admission::Unmetered;
        };
        let Some(rule) = self.rules.get(&rule_id) else {
            return Admission::Unmetered;
        };
        if rule.is_master {
            return Admission::Unmetered;
        }

        let status = self
            .status
            .entry(rule_id.clone())
            .or_insert_with(|| AccessStatus::fresh(&rule_id, now));

        if status.blocked || status.used_time >= rule.daily_limit {
            status.blocked = true;
            debug!(ip = %ip, rule = %rule.title, "Access denied: daily limit reached");
            return Admission::Refused;
        }

        if status.active_since.is_none() {
            status.active_since = Some(now);
        }
        status.active_sessions += 1;
        status.last_access = Some(now);
        Admission::Metered(rule_id)
    }

    /// Close one session of `rule_id`, billing the window when it was the
    /// last one open. Returns whether persisted usage changed.
    fn close_session(&mut self, rule_id: &str, now: DateTime<Utc>) -> bool {
        let Some(rule) = self.rules.get(rule_id) else {
            return false;
        };
        if rule.is_master {
            return false;
        }
        let Some(status) = self.status.get_mut(rule_id) else {
            return false;
        };
        if status.active_sessions == 0 {
            return false;
        }

        status.active_sessions -= 1;
        if status.active_sessions > 0 {
            return false;
        }

        let Some(since) = status.active_since.take() else {
            return false;
        };
        let elapsed = (now - since).to_std().unwrap_or(Duration::ZERO);
        status.used_time += elapsed;
        status.last_access = Some(now);
        status.blocked = status.used_time >= rule.daily_limit;
        if status.blocked {
            info!(
                ip = %rule.ip,
                rule = %rule.title,
                used_secs = status.used_time.as_secs(),
                "Daily limit reached, IP blocked until midnight"
            );
        }
        true
    }

    fn snapshot(&self, rule_id: &str) -> Option<(AccessRule, AccessStatus)> {
        let rule = self.rules.get(rule_id)?;
        let status = self
            .status
            .get(rule_id)
            .cloned()
            .unwrap_or_else(|| AccessStatus::fresh(rule_id, Utc::now()));
        Some((rule.clone(), status))
    }

    fn ensure_ip_free(&self, ip: IpAddr, except: Option<&str>) -> Result<(), AccessError> {
        match self.by_ip.get(&ip) {
            Some(rule_id) if Some(rule_id.as_str()) != except => Err(AccessError::DuplicateIp {
                ip,
                rule_id: rule_id.clone(),
            }),
            _ => Ok(()),
        }
    }
}

enum Admission {
    Refused,
    /// No rule or a master rule: nothing to account
    Unmetered,
    Metered(String),
}

/// Quota enforcement shared by every front-end
pub struct AccessControl {
    state: RwLock<AccessState>,
    store: Option<Arc<dyn ConfigStore>>,
    /// Taken before the state lock is released so snapshots are written in
    /// the order they were taken
    persist_lock: Mutex<()>,
}

impl std::fmt::Debug for AccessControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessControl")
            .field("persistent", &self.store.is_some())
            .finish()
    }
}

impl Default for AccessControl {
    fn default() -> Self {
        Self::new()
    }
}

impl AccessControl {
    /// Access control without persistence and without rules
    pub fn new() -> Self {
        Self {
            state: RwLock::new(AccessState::default()),
            store: None,
            persist_lock: Mutex::new(()),
        }
    }

    /// Load rules from `store`; every mutation is written back to it
    pub fn with_store(store: Arc<dyn ConfigStore>) -> Result<Self, AccessError> {
        let config = store.load()?;
        let state = AccessState::from_records(config.rules, Local::now());
        info!(rules = state.rules.len(), "Access rules loaded");

        Ok(Self {
            state: RwLock::new(state),
            store: Some(store),
            persist_lock: Mutex::new(()),
        })
    }

    /// Admit or refuse a session from `ip`
    pub async fn start_session(&self, ip: IpAddr) -> bool {
        self.start_session_at(ip, Utc::now()).await
    }

    /// [`start_session`](Self::start_session) at an explicit instant
    pub async fn start_session_at(&self, ip: IpAddr, now: DateTime<Utc>) -> bool {
        !matches!(self.state.write().await.admit(ip, now), Admission::Refused)
    }

    /// Close a session from `ip`, billing the elapsed window when it was the
    /// last one open
    pub async fn end_session(&self, ip: IpAddr) {
        self.end_session_at(ip, Utc::now()).await
    }

    /// [`end_session`](Self::end_session) at an explicit instant
    pub async fn end_session_at(&self, ip: IpAddr, now: DateTime<Utc>) {
        let mut state = self.state.write().await;
        let Some(rule_id) = state.by_ip.get(&ip).cloned() else {
            return;
        };
        if state.close_session(&rule_id, now) {
            if let Err(e) = self.persist(state).await {
                warn!("Failed to persist access usage: {}", e);
            }
        }
    }

    /// Admit a session from `ip` and tie its end to the returned guard.
    ///
    /// The guard stays bound to the rule that admitted it, so the session
    /// is closed even if the rule's address changes meanwhile. `None` means
    /// the client is refused.
    pub async fn open_session(self: &Arc<Self>, ip: IpAddr) -> Option<SessionGuard> {
        self.open_session_at(ip, Utc::now()).await
    }

    /// [`open_session`](Self::open_session) at an explicit instant
    pub async fn open_session_at(
        self: &Arc<Self>,
        ip: IpAddr,
        now: DateTime<Utc>,
    ) -> Option<SessionGuard> {
        let rule_id = match self.state.write().await.admit(ip, now) {
            Admission::Refused => return None,
            Admission::Unmetered => None,
            Admission::Metered(rule_id) => Some(rule_id),
        };
        Some(SessionGuard {
            access: Arc::clone(self),
            rule_id,
        })
    }

    async fn end_rule_session(&self, rule_id: &str, now: DateTime<Utc>) {
        let mut state = self.state.write().await;
        if state.close_session(rule_id, now) {
            if let Err(e) = self.persist(state).await {
                warn!("Failed to persist access usage: {}", e);
            }
        }
    }

    pub async fn is_master(&self, ip: IpAddr) -> bool {
        let state = self.state.read().await;
        state
            .by_ip
            .get(&ip)
            .and_then(|id| state.rules.get(id))
            .map(|rule| rule.is_master)
            .unwrap_or(false)
    }

    pub async fn add_rule(&self, new: NewRule) -> Result<AccessRule, AccessError> {
        let mut state = self.state.write().await;
        state.ensure_ip_free(new.ip, None)?;

        let now = Utc::now();
        let rule = AccessRule {
            id: uuid::Uuid::new_v4().to_string(),
            title: new.title,
            ip: new.ip,
            is_master: new.is_master,
            daily_limit: effective_limit(new.daily_limit),
            description: new.description,
            created_at: now,
            updated_at: now,
        };

        state.by_ip.insert(rule.ip, rule.id.clone());
        state
            .status
            .insert(rule.id.clone(), AccessStatus::fresh(&rule.id, now));
        state.rules.insert(rule.id.clone(), rule.clone());
        self.persist(state).await?;

        info!(rule = %rule.title, ip = %rule.ip, master = rule.is_master, "Access rule added");
        Ok(rule)
    }

    /// Replace a rule's fields, keeping its usage
    pub async fn update_rule(&self, id: &str, new: NewRule) -> Result<AccessRule, AccessError> {
        let mut state = self.state.write().await;
        let old = state
            .rules
            .get(id)
            .cloned()
            .ok_or_else(|| AccessError::RuleNotFound(id.to_string()))?;
        state.ensure_ip_free(new.ip, Some(id))?;

        let rule = AccessRule {
            id: old.id.clone(),
            title: new.title,
            ip: new.ip,
            is_master: new.is_master,
            daily_limit: effective_limit(new.daily_limit),
            description: new.description,
            created_at: old.created_at,
            updated_at: Utc::now(),
        };

        if old.ip != rule.ip {
            state.by_ip.remove(&old.ip);
        }
        state.by_ip.insert(rule.ip, rule.id.clone());

        if let Some(status) = state.status.get_mut(id) {
            status.blocked = !rule.is_master && status.used_time >= rule.daily_limit;
        }
        state.rules.insert(rule.id.clone(), rule.clone());
        self.persist(state).await?;

        info!(rule = %rule.title, ip = %rule.ip, "Access rule updated");
        Ok(rule)
    }

    pub async fn delete_rule(&self, id: &str) -> Result<(), AccessError> {
        let mut state = self.state.write().await;
        let rule = state
            .rules
            .remove(id)
            .ok_or_else(|| AccessError::RuleNotFound(id.to_string()))?;
        state.by_ip.remove(&rule.ip);
        state.status.remove(id);
        self.persist(state).await?;

        info!(rule = %rule.title, ip = %rule.ip, "Access rule deleted");
        Ok(())
    }

    /// Clear a rule's usage for today
    pub async fn reset_rule(&self, id: &str) -> Result<(), AccessError> {
        let mut state = self.state.write().await;
        if !state.rules.contains_key(id) {
            return Err(AccessError::RuleNotFound(id.to_string()));
        }
        let now = Utc::now();
        state
            .status
            .entry(id.to_string())
            .or_insert_with(|| AccessStatus::fresh(id, now))
            .reset(now);
        self.persist(state).await
    }

    pub async fn get_rule(&self, id: &str) -> Option<(AccessRule, AccessStatus)> {
        self.state.read().await.snapshot(id)
    }

    pub async fn get_rule_by_ip(&self, ip: IpAddr) -> Option<(AccessRule, AccessStatus)> {
        let state = self.state.read().await;
        let id = state.by_ip.get(&ip)?;
        state.snapshot(id)
    }

    /// All rules, oldest first
    pub async fn list_rules(&self) -> Vec<(AccessRule, AccessStatus)> {
        let state = self.state.read().await;
        let mut rules: Vec<_> = state
            .rules
            .keys()
            .filter_map(|id| state.snapshot(id))
            .collect();
        rules.sort_by(|(a, _), (b, _)| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        rules
    }

    /// Zero usage and lift quota blocks for every non-master rule
    pub async fn reset_daily_usage(&self, now: DateTime<Utc>) {
        let mut state = self.state.write().await;
        let AccessState { rules, status, .. } = &mut *state;

        let mut reset = 0;
        for rule in rules.values().filter(|rule| !rule.is_master) {
            if let Some(status) = status.get_mut(&rule.id) {
                status.reset(now);
                reset += 1;
            }
        }

        if let Err(e) = self.persist(state).await {
            warn!("Failed to persist daily reset: {}", e);
        }
        info!(rules = reset, "Daily access usage reset");
    }

    /// Run [`reset_daily_usage`](Self::reset_daily_usage) at every local
    /// midnight until `cancel` fires
    pub fn spawn_daily_reset(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let access = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let now = Local::now();
                let next = next_local_midnight(now);
                let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
                debug!(next_reset = %next, "Scheduled daily access reset");

                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Daily access reset scheduler stopped");
                        return;
                    }
                    _ = tokio::time::sleep(wait) => {
                        access.reset_daily_usage(Utc::now()).await;
                    }
                }
            }
        })
    }

    /// Write the rules held in `state` to the store, off the async workers.
    /// The state lock is released before the write starts.
    async fn persist(&self, state: RwLockWriteGuard<'_, AccessState>) -> Result<(), AccessError> {
        let Some(store) = self.store.clone() else {
            return Ok(());
        };
        let records = state.to_records();
        let _order = self.persist_lock.lock().await;
        drop(state);

        tokio::task::spawn_blocking(move || {
            store.update(&mut |config| config.rules = records.clone())
        })
        .await
        .map_err(|e| ConfigError::Unavailable(e.to_string()))??;
        Ok(())
    }
}

/// Open session admitted by [`AccessControl::open_session`].
///
/// [`end`](Self::end) closes it in place; dropping it unended closes it on a
/// spawned task, stamped with the time of the drop.
#[must_use = "dropping the guard ends the session"]
pub struct SessionGuard {
    access: Arc<AccessControl>,
    rule_id: Option<String>,
}

impl SessionGuard {
    /// Id of the rule billing this session; `None` when unmetered
    pub fn rule_id(&self) -> Option<&str> {
        self.rule_id.as_deref()
    }

    pub async fn end(self) {
        self.end_at(Utc::now()).await
    }

    /// [`end`](Self::end) at an explicit instant
    pub async fn end_at(mut self, now: DateTime<Utc>) {
        if let Some(rule_id) = self.rule_id.take() {
            self.access.end_rule_session(&rule_id, now).await;
        }
    }
}

impl std::fmt::Debug for SessionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionGuard")
            .field("rule_id", &self.rule_id)
            .finish()
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let Some(rule_id) = self.rule_id.take() else {
            return;
        };
        let ended_at = Utc::now();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let access = Arc::clone(&self.access);
                handle.spawn(async move {
                    access.end_rule_session(&rule_id, ended_at).await;
                });
            }
            Err(_) => warn!(rule = %rule_id, "Session dropped outside the runtime, usage not billed"),
        }
    }
}

/// A zero limit falls back to [`DEFAULT_DAILY_LIMIT`]
fn effective_limit(limit: Duration) -> Duration {
    if limit.is_zero() {
        DEFAULT_DAILY_LIMIT
    } else {
        limit
    }
}

/// First instant of the next local calendar day
pub fn next_local_midnight(now: DateTime<Local>) -> DateTime<Local> {
    let fallback = now + chrono::Duration::hours(24);
    let Some(tomorrow) = now.date_naive().succ_opt() else {
        return fallback;
    };
    let Some(midnight) = tomorrow.and_hms_opt(0, 0, 0) else {
        return fallback;
    };
    Local
        .from_local_datetime(&midnight)
        .earliest()
        .unwrap_or(fallback)
}
