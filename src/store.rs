//! Persistence contract for baselines, settled-spend events, and denial
//! records, plus the in-memory baseline cache consulted on every evaluation.
//!
//! The trait is the canonical interface; `InMemoryBaselineStore` backs unit
//! tests and small deployments, `SqliteBaselineStore` is the durable
//! implementation. Both are interchangeable behind `Arc<dyn BaselineStore>`.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Timelike, Utc};
use parking_lot::RwLock;
use rusqlite::{params, Connection};
use thiserror::Error;
use uuid::Uuid;

use crate::amount::UsdcAmount;
use crate::tier::Tier;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("lock poisoned")]
    Poisoned,
}

/// Per-agent mean/stddev of hourly settled spend, learned from the last 7
/// days. Only valid for evaluation once `sample_hours >= 24`.
#[derive(Debug, Clone)]
pub struct AgentBaseline {
    pub agent_addr: String,
    pub hourly_mean: UsdcAmount,
    pub hourly_stddev: UsdcAmount,
    pub sample_hours: u32,
    pub last_updated: DateTime<Utc>,
}

impl AgentBaseline {
    pub fn is_valid(&self) -> bool {
        self.sample_hours >= 24
    }
}

/// Persisted form of an observed settled spend.
#[derive(Debug, Clone)]
pub struct SpendEventRecord {
    pub id: Uuid,
    pub agent_addr: String,
    pub counterparty: String,
    pub amount: UsdcAmount,
    pub created_at: DateTime<Utc>,
}

impl SpendEventRecord {
    pub fn new(agent_addr: &str, counterparty: &str, amount: UsdcAmount, created_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            agent_addr: agent_addr.to_lowercase(),
            counterparty: counterparty.to_lowercase(),
            amount,
            created_at,
        }
    }
}

/// Retention window for spend events: 7 days for baseline computation plus a
/// 1-day buffer.
pub const SPEND_EVENT_RETENTION: ChronoDuration = ChronoDuration::days(8);
pub const BASELINE_SAMPLE_WINDOW: ChronoDuration = ChronoDuration::days(7);

/// Feature vector written for every `Deny` verdict, for offline analysis.
#[derive(Debug, Clone)]
pub struct DenialRecord {
    pub agent_addr: String,
    pub rule_name: String,
    pub reason: String,
    pub amount: UsdcAmount,
    pub op_type: String,
    pub tier: Tier,
    pub counterparty: String,
    pub hourly_total: UsdcAmount,
    pub baseline_mean: Option<UsdcAmount>,
    pub baseline_stddev: Option<UsdcAmount>,
    pub override_allowed: bool,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait BaselineStore: Send + Sync {
    async fn save_baseline_batch(&self, baselines: &[AgentBaseline]) -> Result<(), StoreError>;
    async fn get_all_baselines(&self) -> Result<Vec<AgentBaseline>, StoreError>;
    async fn append_spend_event_batch(&self, events: &[SpendEventRecord]) -> Result<(), StoreError>;
    async fn get_recent_spend_events(&self, since: DateTime<Utc>) -> Result<Vec<SpendEventRecord>, StoreError>;
    async fn get_all_agents_with_events(&self, since: DateTime<Utc>) -> Result<Vec<String>, StoreError>;
    async fn get_hourly_totals(&self, addr: &str, since: DateTime<Utc>) -> Result<BTreeMap<DateTime<Utc>, UsdcAmount>, StoreError>;
    async fn log_denial(&self, denial: &DenialRecord) -> Result<(), StoreError>;
    async fn prune_old_events(&self, before: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// In-memory implementation backing unit/integration tests and
/// small single-process deployments.
#[derive(Default)]
pub struct InMemoryBaselineStore {
    inner: RwLock<InMemoryState>,
}

#[derive(Default)]
struct InMemoryState {
    baselines: HashMap<String, AgentBaseline>,
    events: Vec<SpendEventRecord>,
    denials: Vec<DenialRecord>,
}

impl InMemoryBaselineStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn denial_count(&self) -> usize {
        self.inner.read().denials.len()
    }
}

#[async_trait]
impl BaselineStore for InMemoryBaselineStore {
    async fn save_baseline_batch(&self, baselines: &[AgentBaseline]) -> Result<(), StoreError> {
        let mut state = self.inner.write();
        for baseline in baselines {
            state.baselines.insert(baseline.agent_addr.clone(), baseline.clone());
        }
        Ok(())
    }

    async fn get_all_baselines(&self) -> Result<Vec<AgentBaseline>, StoreError> {
        Ok(self.inner.read().baselines.values().cloned().collect())
    }

    async fn append_spend_event_batch(&self, events: &[SpendEventRecord]) -> Result<(), StoreError> {
        self.inner.write().events.extend_from_slice(events);
        Ok(())
    }

    async fn get_recent_spend_events(&self, since: DateTime<Utc>) -> Result<Vec<SpendEventRecord>, StoreError> {
        let mut events: Vec<_> = self
            .inner
            .read()
            .events
            .iter()
            .filter(|e| e.created_at >= since)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.created_at);
        Ok(events)
    }

    async fn get_all_agents_with_events(&self, since: DateTime<Utc>) -> Result<Vec<String>, StoreError> {
        let state = self.inner.read();
        let mut agents: Vec<String> = state
            .events
            .iter()
            .filter(|e| e.created_at >= since)
            .map(|e| e.agent_addr.clone())
            .collect();
        agents.sort();
        agents.dedup();
        Ok(agents)
    }

    async fn get_hourly_totals(&self, addr: &str, since: DateTime<Utc>) -> Result<BTreeMap<DateTime<Utc>, UsdcAmount>, StoreError> {
        let addr = addr.to_lowercase();
        let state = self.inner.read();
        let mut totals: BTreeMap<DateTime<Utc>, UsdcAmount> = BTreeMap::new();
        for event in state.events.iter().filter(|e| e.agent_addr == addr && e.created_at >= since) {
            let bucket = truncate_to_hour(event.created_at);
            let entry = totals.entry(bucket).or_insert(UsdcAmount::ZERO);
            *entry = entry.checked_add(&event.amount).unwrap_or(*entry);
        }
        Ok(totals)
    }

    async fn log_denial(&self, denial: &DenialRecord) -> Result<(), StoreError> {
        self.inner.write().denials.push(denial.clone());
        Ok(())
    }

    async fn prune_old_events(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut state = self.inner.write();
        let before_len = state.events.len();
        state.events.retain(|e| e.created_at >= before);
        Ok((before_len - state.events.len()) as u64)
    }
}

fn truncate_to_hour(at: DateTime<Utc>) -> DateTime<Utc> {
    at.date_naive()
        .and_hms_opt(at.hour(), 0, 0)
        .map(|naive| naive.and_utc())
        .unwrap_or(at)
}

/// SQLite-backed durable implementation, following the codebase's existing
/// `rusqlite`-with-bundled-feature persistence pattern.
pub struct SqliteBaselineStore {
    conn: RwLock<Connection>,
}

impl SqliteBaselineStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let store = Self { conn: RwLock::new(conn) };
        store.init_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn: RwLock::new(conn) };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.conn.write();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS baselines (
                agent_addr TEXT PRIMARY KEY,
                hourly_mean TEXT NOT NULL,
                hourly_stddev TEXT NOT NULL,
                sample_hours INTEGER NOT NULL,
                last_updated TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS spend_events (
                id TEXT PRIMARY KEY,
                agent_addr TEXT NOT NULL,
                counterparty TEXT NOT NULL,
                amount TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_spend_events_agent ON spend_events(agent_addr, created_at);
            CREATE TABLE IF NOT EXISTS denials (
                agent_addr TEXT NOT NULL,
                rule_name TEXT NOT NULL,
                reason TEXT NOT NULL,
                amount TEXT NOT NULL,
                op_type TEXT NOT NULL,
                tier TEXT NOT NULL,
                counterparty TEXT NOT NULL,
                hourly_total TEXT NOT NULL,
                baseline_mean TEXT,
                baseline_stddev TEXT,
                override_allowed INTEGER NOT NULL,
                created_at TEXT NOT NULL
            );",
        )?;
        Ok(())
    }
}

#[async_trait]
impl BaselineStore for SqliteBaselineStore {
    async fn save_baseline_batch(&self, baselines: &[AgentBaseline]) -> Result<(), StoreError> {
        let conn = self.conn.write();
        for baseline in baselines {
            conn.execute(
                "INSERT INTO baselines (agent_addr, hourly_mean, hourly_stddev, sample_hours, last_updated)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(agent_addr) DO UPDATE SET
                    hourly_mean = excluded.hourly_mean,
                    hourly_stddev = excluded.hourly_stddev,
                    sample_hours = excluded.sample_hours,
                    last_updated = excluded.last_updated",
                params![
                    baseline.agent_addr,
                    baseline.hourly_mean.format(),
                    baseline.hourly_stddev.format(),
                    baseline.sample_hours,
                    baseline.last_updated.to_rfc3339(),
                ],
            )?;
        }
        Ok(())
    }

    async fn get_all_baselines(&self) -> Result<Vec<AgentBaseline>, StoreError> {
        let conn = self.conn.read();
        let mut stmt = conn.prepare("SELECT agent_addr, hourly_mean, hourly_stddev, sample_hours, last_updated FROM baselines")?;
        let rows = stmt.query_map([], row_to_baseline)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    async fn append_spend_event_batch(&self, events: &[SpendEventRecord]) -> Result<(), StoreError> {
        let conn = self.conn.write();
        for event in events {
            conn.execute(
                "INSERT INTO spend_events (id, agent_addr, counterparty, amount, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    event.id.to_string(),
                    event.agent_addr,
                    event.counterparty,
                    event.amount.format(),
                    event.created_at.to_rfc3339(),
                ],
            )?;
        }
        Ok(())
    }

    async fn get_recent_spend_events(&self, since: DateTime<Utc>) -> Result<Vec<SpendEventRecord>, StoreError> {
        let conn = self.conn.read();
        let mut stmt = conn.prepare(
            "SELECT id, agent_addr, counterparty, amount, created_at FROM spend_events
             WHERE created_at >= ?1 ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map(params![since.to_rfc3339()], row_to_event)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    async fn get_all_agents_with_events(&self, since: DateTime<Utc>) -> Result<Vec<String>, StoreError> {
        let conn = self.conn.read();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT agent_addr FROM spend_events WHERE created_at >= ?1 ORDER BY agent_addr",
        )?;
        let rows = stmt.query_map(params![since.to_rfc3339()], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    async fn get_hourly_totals(&self, addr: &str, since: DateTime<Utc>) -> Result<BTreeMap<DateTime<Utc>, UsdcAmount>, StoreError> {
        let recent = self.get_recent_spend_events(since).await?;
        let addr = addr.to_lowercase();
        let mut totals: BTreeMap<DateTime<Utc>, UsdcAmount> = BTreeMap::new();
        for event in recent.into_iter().filter(|e| e.agent_addr == addr) {
            let bucket = truncate_to_hour(event.created_at);
            let entry = totals.entry(bucket).or_insert(UsdcAmount::ZERO);
            *entry = entry.checked_add(&event.amount).unwrap_or(*entry);
        }
        Ok(totals)
    }

    async fn log_denial(&self, denial: &DenialRecord) -> Result<(), StoreError> {
        let conn = self.conn.write();
        conn.execute(
            "INSERT INTO denials (agent_addr, rule_name, reason, amount, op_type, tier, counterparty,
                hourly_total, baseline_mean, baseline_stddev, override_allowed, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                denial.agent_addr,
                denial.rule_name,
                denial.reason,
                denial.amount.format(),
                denial.op_type,
                denial.tier.as_str(),
                denial.counterparty,
                denial.hourly_total.format(),
                denial.baseline_mean.map(|a| a.format()),
                denial.baseline_stddev.map(|a| a.format()),
                denial.override_allowed as i64,
                denial.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    async fn prune_old_events(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        let conn = self.conn.write();
        let deleted = conn.execute(
            "DELETE FROM spend_events WHERE created_at < ?1",
            params![before.to_rfc3339()],
        )?;
        Ok(deleted as u64)
    }
}

fn row_to_baseline(row: &rusqlite::Row<'_>) -> rusqlite::Result<AgentBaseline> {
    let mean: String = row.get(1)?;
    let stddev: String = row.get(2)?;
    let last_updated: String = row.get(4)?;
    Ok(AgentBaseline {
        agent_addr: row.get(0)?,
        hourly_mean: UsdcAmount::parse(&mean).unwrap_or(UsdcAmount::ZERO),
        hourly_stddev: UsdcAmount::parse(&stddev).unwrap_or(UsdcAmount::ZERO),
        sample_hours: row.get(3)?,
        last_updated: DateTime::parse_from_rfc3339(&last_updated)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<SpendEventRecord> {
    let id: String = row.get(0)?;
    let amount: String = row.get(3)?;
    let created_at: String = row.get(4)?;
    Ok(SpendEventRecord {
        id: Uuid::parse_str(&id).unwrap_or_else(|_| Uuid::new_v4()),
        agent_addr: row.get(1)?,
        counterparty: row.get(2)?,
        amount: UsdcAmount::parse(&amount).unwrap_or(UsdcAmount::ZERO),
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

/// In-memory baseline cache consulted by `BaselineRule` on every evaluation.
/// Separate from `SpendGraph`'s lock: reads happen on the request path,
/// writes only on the hourly `BaselineTimer` refresh.
#[derive(Default)]
pub struct BaselineCache {
    baselines: RwLock<HashMap<String, AgentBaseline>>,
}

impl BaselineCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, agent_addr: &str) -> Option<AgentBaseline> {
        self.baselines.read().get(&agent_addr.to_lowercase()).cloned()
    }

    pub fn merge(&self, baselines: Vec<AgentBaseline>) {
        let mut cache = self.baselines.write();
        for baseline in baselines {
            let key = baseline.agent_addr.to_lowercase();
            cache.insert(key, baseline);
        }
    }

    pub fn len(&self) -> usize {
        self.baselines.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
