//! Property-graph persistence and abuse detection.
//!
//! All analytic data lives on append-only Event nodes; identity nodes
//! (IPAddress, Session, User, Tenant) exist only to be traversed to/from
//! Events and are upserted lazily on first reference.

pub mod memory;
pub mod neo4j;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::error::AppResult;
use crate::events::Event;

pub use memory::MemoryStore;
pub use neo4j::Neo4jStore;

/// Half-open time window `[since, until)` for detection queries.
#[derive(Debug, Clone, Copy)]
pub struct Window {
    pub since: DateTime<Utc>,
    pub until: DateTime<Utc>,
}

impl Window {
    /// The trailing `minutes` ending now.
    pub fn last_minutes(minutes: i64) -> Self {
        let until = Utc::now();
        Self {
            since: until - Duration::minutes(minutes),
            until,
        }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.since && ts < self.until
    }
}

/// An IP address with an activity count (failures, requests or issuances
/// depending on the query).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpActivity {
    pub address: String,
    pub count: u64,
}

/// A session observed acting as more than one user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedSession {
    pub session_id: String,
    pub user_ids: Vec<i64>,
}

impl SharedSession {
    pub fn user_count(&self) -> u64 {
        self.user_ids.len() as u64
    }
}

/// A token-id observed under more than one user or tenant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenReuse {
    pub token_id: String,
    pub user_count: u64,
    pub tenant_count: u64,
}

/// A request path with a hit count, for attack-surface ranking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathHits {
    pub path: String,
    pub count: u64,
}

/// The graph store contract shared by the Bolt-backed implementation and
/// the in-memory one used by tests and local development.
///
/// Write operations are invoked only by the analytics consumer; detection
/// queries are read-only and never mutate state. Archived events are
/// excluded from every detection.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Creates uniqueness constraints and indexes. Idempotent.
    async fn ensure_schema(&self) -> AppResult<()>;

    /// Persists a batch of events in one transaction: append-only Event
    /// nodes, idempotent identity upserts, relationships, and NEXT_EVENT
    /// chaining within sessions.
    async fn write_batch(&self, events: &[Event]) -> AppResult<()>;

    /// Flags events older than `cutoff` as archived. Returns the number of
    /// events flipped.
    async fn archive_events(&self, cutoff: DateTime<Utc>) -> AppResult<u64>;

    /// Permanently deletes events older than `cutoff` and prunes identity
    /// nodes left with zero event relationships. Returns the number of
    /// events removed.
    async fn purge_events(&self, cutoff: DateTime<Utc>) -> AppResult<u64>;

    /// (a) Brute force: IPs with at least `threshold` failed validations
    /// in the window.
    async fn failed_validations_by_ip(
        &self,
        window: Window,
        threshold: u64,
    ) -> AppResult<Vec<IpActivity>>;

    /// (b) Volumetric abuse: IPs with at least `threshold` events of any
    /// kind in the window.
    async fn request_volume_by_ip(
        &self,
        window: Window,
        threshold: u64,
    ) -> AppResult<Vec<IpActivity>>;

    /// (c) Session sharing: sessions associated with more than one user.
    async fn sessions_with_multiple_users(&self, window: Window)
        -> AppResult<Vec<SharedSession>>;

    /// (d) Token theft/replay: token-ids seen under more than one user or
    /// more than one tenant.
    async fn tokens_with_multiple_identities(
        &self,
        window: Window,
    ) -> AppResult<Vec<TokenReuse>>;

    /// (e) Scan without conversion: IPs issued at least `threshold`
    /// pre-auth tokens with zero successful validations in the window.
    async fn ips_issuing_without_conversion(
        &self,
        window: Window,
        threshold: u64,
    ) -> AppResult<Vec<IpActivity>>;

    /// (f) Attack surface: most-targeted paths among failed validations
    /// against one tenant.
    async fn targeted_paths_for_tenant(
        &self,
        window: Window,
        tenant_id: &str,
        limit: usize,
    ) -> AppResult<Vec<PathHits>>;
}
