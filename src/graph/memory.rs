//! In-memory graph store.
//!
//! Mirrors the Bolt-backed store's semantics over plain collections so the
//! ingest and detection logic can be exercised without a running database.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::error::AppResult;
use crate::events::{Action, Event, Status};

use super::{GraphStore, IpActivity, PathHits, SharedSession, TokenReuse, Window};

/// First/last observation times for an identity node.
#[derive(Debug, Clone, Copy)]
struct Seen {
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
}

impl Seen {
    fn observe(&mut self, at: DateTime<Utc>) {
        if at < self.first_seen {
            self.first_seen = at;
        }
        if at > self.last_seen {
            self.last_seen = at;
        }
    }
}

#[derive(Debug, Default)]
struct State {
    events: Vec<Event>,
    ips: HashMap<String, Seen>,
    sessions: HashMap<String, Seen>,
    users: HashMap<i64, Seen>,
    tenants: HashMap<String, Seen>,
    // (predecessor event_id, successor event_id)
    next_event: Vec<(String, String)>,
}

impl State {
    fn upsert(&mut self, event: &Event) {
        let at = event.timestamp;
        let seen = Seen {
            first_seen: at,
            last_seen: at,
        };

        self.ips
            .entry(event.client_ip.clone())
            .and_modify(|s| s.observe(at))
            .or_insert(seen);
        if let Some(session_id) = &event.session_id {
            self.sessions
                .entry(session_id.clone())
                .and_modify(|s| s.observe(at))
                .or_insert(seen);
        }
        if let Some(user_id) = event.user_id {
            self.users
                .entry(user_id)
                .and_modify(|s| s.observe(at))
                .or_insert(seen);
        }
        if let Some(tenant_id) = &event.tenant_id {
            self.tenants
                .entry(tenant_id.clone())
                .and_modify(|s| s.observe(at))
                .or_insert(seen);
        }
    }

    /// Most recent event in the same session that strictly precedes `event`,
    /// with event_id as the tie-break for identical timestamps.
    ///
    /// Resolved against the events already written. When an event arrives
    /// after one of its in-session successors, both link to the same
    /// predecessor and the chain forks instead of splicing. Traversal by
    /// timestamp remains correct, so forks are accepted.
    fn chain_predecessor(&self, event: &Event) -> Option<String> {
        let session_id = event.session_id.as_ref()?;
        self.events
            .iter()
            .filter(|prev| {
                prev.session_id.as_ref() == Some(session_id)
                    && (prev.timestamp, &prev.event_id) < (event.timestamp, &event.event_id)
            })
            .max_by(|a, b| (a.timestamp, &a.event_id).cmp(&(b.timestamp, &b.event_id)))
            .map(|prev| prev.event_id.clone())
    }

    fn live<'a>(&'a self, window: &'a Window) -> impl Iterator<Item = &'a Event> {
        self.events
            .iter()
            .filter(move |e| !e.archived && window.contains(e.timestamp))
    }
}

fn is_failed_validation(event: &Event) -> bool {
    event.action == Action::TokenValidated && event.status == Some(Status::Fail)
}

fn is_passed_validation(event: &Event) -> bool {
    event.action == Action::TokenValidated && event.status == Some(Status::Pass)
}

/// Node and relationship counts, for assertions and introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GraphCounts {
    pub events: usize,
    pub ip_nodes: usize,
    pub session_nodes: usize,
    pub user_nodes: usize,
    pub tenant_nodes: usize,
    pub originated_from_edges: usize,
    pub in_session_edges: usize,
    pub performed_by_edges: usize,
    pub targeted_tenant_edges: usize,
    pub next_event_edges: usize,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn counts(&self) -> GraphCounts {
        let state = self.state.read().await;
        GraphCounts {
            events: state.events.len(),
            ip_nodes: state.ips.len(),
            session_nodes: state.sessions.len(),
            user_nodes: state.users.len(),
            tenant_nodes: state.tenants.len(),
            originated_from_edges: state.events.len(),
            in_session_edges: state.events.iter().filter(|e| e.session_id.is_some()).count(),
            performed_by_edges: state.events.iter().filter(|e| e.user_id.is_some()).count(),
            targeted_tenant_edges: state.events.iter().filter(|e| e.tenant_id.is_some()).count(),
            next_event_edges: state.next_event.len(),
        }
    }

    pub async fn events(&self) -> Vec<Event> {
        self.state.read().await.events.clone()
    }

    pub async fn next_event_edges(&self) -> Vec<(String, String)> {
        self.state.read().await.next_event.clone()
    }
}

#[async_trait]
impl GraphStore for MemoryStore {
    async fn ensure_schema(&self) -> AppResult<()> {
        Ok(())
    }

    async fn write_batch(&self, events: &[Event]) -> AppResult<()> {
        let mut state = self.state.write().await;
        for event in events {
            // Duplicate delivery resolves to the same node
            if state.events.iter().any(|e| e.event_id == event.event_id) {
                continue;
            }
            state.upsert(event);
            if let Some(prev_id) = state.chain_predecessor(event) {
                state.next_event.push((prev_id, event.event_id.clone()));
            }
            state.events.push(event.clone());
        }
        Ok(())
    }

    async fn archive_events(&self, cutoff: DateTime<Utc>) -> AppResult<u64> {
        let mut state = self.state.write().await;
        let mut flipped = 0;
        for event in &mut state.events {
            if !event.archived && event.timestamp < cutoff {
                event.archived = true;
                flipped += 1;
            }
        }
        Ok(flipped)
    }

    async fn purge_events(&self, cutoff: DateTime<Utc>) -> AppResult<u64> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;

        let before = state.events.len();
        state.events.retain(|e| e.timestamp >= cutoff);
        let purged = (before - state.events.len()) as u64;

        let remaining: BTreeSet<&str> =
            state.events.iter().map(|e| e.event_id.as_str()).collect();
        state
            .next_event
            .retain(|(a, b)| remaining.contains(a.as_str()) && remaining.contains(b.as_str()));

        // Prune identities with no surviving events
        let ips: BTreeSet<&str> = state.events.iter().map(|e| e.client_ip.as_str()).collect();
        let sessions: BTreeSet<&str> = state
            .events
            .iter()
            .filter_map(|e| e.session_id.as_deref())
            .collect();
        let users: BTreeSet<i64> = state.events.iter().filter_map(|e| e.user_id).collect();
        let tenants: BTreeSet<&str> = state
            .events
            .iter()
            .filter_map(|e| e.tenant_id.as_deref())
            .collect();

        state.ips.retain(|k, _| ips.contains(k.as_str()));
        state.sessions.retain(|k, _| sessions.contains(k.as_str()));
        state.users.retain(|k, _| users.contains(k));
        state.tenants.retain(|k, _| tenants.contains(k.as_str()));

        Ok(purged)
    }

    async fn failed_validations_by_ip(
        &self,
        window: Window,
        threshold: u64,
    ) -> AppResult<Vec<IpActivity>> {
        let state = self.state.read().await;
        let mut by_ip: HashMap<&str, u64> = HashMap::new();
        for event in state.live(&window).filter(|e| is_failed_validation(e)) {
            *by_ip.entry(event.client_ip.as_str()).or_default() += 1;
        }
        Ok(rank_ips(by_ip, threshold))
    }

    async fn request_volume_by_ip(
        &self,
        window: Window,
        threshold: u64,
    ) -> AppResult<Vec<IpActivity>> {
        let state = self.state.read().await;
        let mut by_ip: HashMap<&str, u64> = HashMap::new();
        for event in state.live(&window) {
            *by_ip.entry(event.client_ip.as_str()).or_default() += 1;
        }
        Ok(rank_ips(by_ip, threshold))
    }

    async fn sessions_with_multiple_users(
        &self,
        window: Window,
    ) -> AppResult<Vec<SharedSession>> {
        let state = self.state.read().await;
        let mut by_session: HashMap<&str, BTreeSet<i64>> = HashMap::new();
        for event in state.live(&window) {
            if let (Some(session_id), Some(user_id)) = (&event.session_id, event.user_id) {
                by_session.entry(session_id).or_default().insert(user_id);
            }
        }

        let mut shared: Vec<SharedSession> = by_session
            .into_iter()
            .filter(|(_, users)| users.len() > 1)
            .map(|(session_id, users)| SharedSession {
                session_id: session_id.to_string(),
                user_ids: users.into_iter().collect(),
            })
            .collect();
        shared.sort_by(|a, b| {
            b.user_ids
                .len()
                .cmp(&a.user_ids.len())
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        Ok(shared)
    }

    async fn tokens_with_multiple_identities(
        &self,
        window: Window,
    ) -> AppResult<Vec<TokenReuse>> {
        let state = self.state.read().await;
        let mut by_token: HashMap<&str, (BTreeSet<i64>, BTreeSet<&str>)> = HashMap::new();
        for event in state.live(&window) {
            if let Some(token_id) = &event.token_id {
                let entry = by_token.entry(token_id).or_default();
                if let Some(user_id) = event.user_id {
                    entry.0.insert(user_id);
                }
                if let Some(tenant_id) = &event.tenant_id {
                    entry.1.insert(tenant_id);
                }
            }
        }

        let mut reused: Vec<TokenReuse> = by_token
            .into_iter()
            .filter(|(_, (users, tenants))| users.len() > 1 || tenants.len() > 1)
            .map(|(token_id, (users, tenants))| TokenReuse {
                token_id: token_id.to_string(),
                user_count: users.len() as u64,
                tenant_count: tenants.len() as u64,
            })
            .collect();
        reused.sort_by(|a, b| {
            (b.user_count + b.tenant_count)
                .cmp(&(a.user_count + a.tenant_count))
                .then_with(|| a.token_id.cmp(&b.token_id))
        });
        Ok(reused)
    }

    async fn ips_issuing_without_conversion(
        &self,
        window: Window,
        threshold: u64,
    ) -> AppResult<Vec<IpActivity>> {
        let state = self.state.read().await;
        // (issued, converted) per IP
        let mut by_ip: HashMap<&str, (u64, u64)> = HashMap::new();
        for event in state.live(&window) {
            let entry = by_ip.entry(event.client_ip.as_str()).or_default();
            if event.action == Action::TokenIssued {
                entry.0 += 1;
            } else if is_passed_validation(event) {
                entry.1 += 1;
            }
        }

        let issued_only = by_ip
            .into_iter()
            .filter(|(_, (_, converted))| *converted == 0)
            .map(|(ip, (issued, _))| (ip, issued))
            .collect();
        Ok(rank_ips(issued_only, threshold))
    }

    async fn targeted_paths_for_tenant(
        &self,
        window: Window,
        tenant_id: &str,
        limit: usize,
    ) -> AppResult<Vec<PathHits>> {
        let state = self.state.read().await;
        let mut by_path: HashMap<&str, u64> = HashMap::new();
        for event in state
            .live(&window)
            .filter(|e| is_failed_validation(e) && e.tenant_id.as_deref() == Some(tenant_id))
        {
            *by_path.entry(event.path.as_str()).or_default() += 1;
        }

        let mut paths: Vec<PathHits> = by_path
            .into_iter()
            .map(|(path, count)| PathHits {
                path: path.to_string(),
                count,
            })
            .collect();
        paths.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.path.cmp(&b.path)));
        paths.truncate(limit);
        Ok(paths)
    }
}

fn rank_ips(by_ip: HashMap<&str, u64>, threshold: u64) -> Vec<IpActivity> {
    let mut ips: Vec<IpActivity> = by_ip
        .into_iter()
        .filter(|(_, count)| *count >= threshold)
        .map(|(address, count)| IpActivity {
            address: address.to_string(),
            count,
        })
        .collect();
    ips.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.address.cmp(&b.address)));
    ips
}
