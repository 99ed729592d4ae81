//! Bolt-backed graph store.
//!
//! Event nodes are written with MERGE on `event_id` so redelivered batches
//! resolve to the same node. Identity nodes are upserted with MERGE and
//! first_seen/last_seen maintenance, and every relationship is written with
//! MERGE, which keeps the whole batch idempotent under at-least-once
//! delivery. Optional event attributes are compiled into the statement only
//! when present, so no null parameters ever cross the wire.

use chrono::{DateTime, SecondsFormat, Utc};
use neo4rs::{query, Graph, Query};

use crate::config::GraphConfig;
use crate::error::{AppError, AppResult};
use crate::events::{Event, Status};

use super::{GraphStore, IpActivity, PathHits, SharedSession, TokenReuse, Window};

use async_trait::async_trait;

const SCHEMA_STATEMENTS: &[&str] = &[
    "CREATE CONSTRAINT event_id_unique IF NOT EXISTS \
     FOR (e:Event) REQUIRE e.event_id IS UNIQUE",
    "CREATE CONSTRAINT ip_address_unique IF NOT EXISTS \
     FOR (ip:IPAddress) REQUIRE ip.address IS UNIQUE",
    "CREATE CONSTRAINT session_id_unique IF NOT EXISTS \
     FOR (s:Session) REQUIRE s.session_id IS UNIQUE",
    "CREATE CONSTRAINT user_id_unique IF NOT EXISTS \
     FOR (u:User) REQUIRE u.user_id IS UNIQUE",
    "CREATE CONSTRAINT tenant_id_unique IF NOT EXISTS \
     FOR (t:Tenant) REQUIRE t.tenant_id IS UNIQUE",
    "CREATE INDEX event_timestamp IF NOT EXISTS FOR (e:Event) ON (e.timestamp)",
    "CREATE INDEX event_action IF NOT EXISTS FOR (e:Event) ON (e.action)",
    "CREATE INDEX event_status IF NOT EXISTS FOR (e:Event) ON (e.status)",
    "CREATE INDEX event_client_ip IF NOT EXISTS FOR (e:Event) ON (e.client_ip)",
    "CREATE INDEX event_session_id IF NOT EXISTS FOR (e:Event) ON (e.session_id)",
    "CREATE INDEX event_tenant_id IF NOT EXISTS FOR (e:Event) ON (e.tenant_id)",
    "CREATE INDEX event_token_id IF NOT EXISTS FOR (e:Event) ON (e.token_id)",
    "CREATE INDEX event_action_status_timestamp IF NOT EXISTS \
     FOR (e:Event) ON (e.action, e.status, e.timestamp)",
];

// Shared predicate for detection queries: inside the window, not archived.
const LIVE: &str = "e.archived = false \
     AND e.timestamp >= datetime($since) AND e.timestamp < datetime($until)";

fn status_str(status: Status) -> &'static str {
    match status {
        Status::Pass => "pass",
        Status::Fail => "fail",
    }
}

fn rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode_err(e: impl std::fmt::Display) -> AppError {
    AppError::internal(format!("graph row decode failed: {}", e))
}

pub struct Neo4jStore {
    graph: Graph,
}

impl Neo4jStore {
    pub async fn connect(config: &GraphConfig) -> AppResult<Self> {
        tracing::info!(uri = %config.uri, user = %config.user, "Connecting to graph database");
        let graph =
            Graph::new(config.uri.as_str(), config.user.as_str(), config.password.as_str())
                .await?;
        Ok(Self { graph })
    }

    /// Compiles the MERGE statement for one event. Optional attributes are
    /// appended to the ON CREATE clause only when present.
    fn event_query(event: &Event) -> AppResult<Query> {
        let data = event
            .data
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let mut cypher = String::from(
            "MERGE (e:Event {event_id: $event_id}) \
             ON CREATE SET e.action = $action, e.timestamp = datetime($timestamp), \
             e.client_ip = $client_ip, e.path = $path, e.archived = false",
        );
        let optional = [
            ("status", event.status.is_some()),
            ("user_agent", event.user_agent.is_some()),
            ("device_type", event.device_type.is_some()),
            ("query", event.query.is_some()),
            ("session_id", event.session_id.is_some()),
            ("user_id", event.user_id.is_some()),
            ("tenant_id", event.tenant_id.is_some()),
            ("token_id", event.token_id.is_some()),
            ("data", data.is_some()),
        ];
        for (name, present) in optional {
            if present {
                cypher.push_str(&format!(", e.{name} = ${name}"));
            }
        }

        let mut q = query(&cypher)
            .param("event_id", event.event_id.as_str())
            .param("action", event.action.as_str())
            .param("timestamp", rfc3339(event.timestamp))
            .param("client_ip", event.client_ip.as_str())
            .param("path", event.path.as_str());
        if let Some(status) = event.status {
            q = q.param("status", status_str(status));
        }
        if let Some(user_agent) = &event.user_agent {
            q = q.param("user_agent", user_agent.as_str());
        }
        if let Some(device_type) = &event.device_type {
            q = q.param("device_type", device_type.as_str());
        }
        if let Some(query_string) = &event.query {
            q = q.param("query", query_string.as_str());
        }
        if let Some(session_id) = &event.session_id {
            q = q.param("session_id", session_id.as_str());
        }
        if let Some(user_id) = event.user_id {
            q = q.param("user_id", user_id);
        }
        if let Some(tenant_id) = &event.tenant_id {
            q = q.param("tenant_id", tenant_id.as_str());
        }
        if let Some(token_id) = &event.token_id {
            q = q.param("token_id", token_id.as_str());
        }
        if let Some(data) = data {
            q = q.param("data", data);
        }

        Ok(q)
    }

    /// MERGE an identity node, refresh first_seen/last_seen, and attach the
    /// event to it.
    fn identity_query(
        label: &str,
        key: &str,
        rel: &str,
        event_id: &str,
        key_param: IdentityKey<'_>,
        ts: &str,
    ) -> Query {
        let cypher = format!(
            "MATCH (e:Event {{event_id: $event_id}}) \
             MERGE (n:{label} {{{key}: $key}}) \
             ON CREATE SET n.first_seen = datetime($ts), n.last_seen = datetime($ts) \
             ON MATCH SET \
               n.first_seen = CASE WHEN datetime($ts) < n.first_seen \
                 THEN datetime($ts) ELSE n.first_seen END, \
               n.last_seen = CASE WHEN datetime($ts) > n.last_seen \
                 THEN datetime($ts) ELSE n.last_seen END \
             MERGE (e)-[:{rel}]->(n)"
        );
        let q = query(&cypher).param("event_id", event_id).param("ts", ts);
        match key_param {
            IdentityKey::Str(s) => q.param("key", s),
            IdentityKey::Int(i) => q.param("key", i),
        }
    }

    /// Tenant upsert carries denormalized path/query on the relationship so
    /// per-tenant attack-surface queries can skip the Event node.
    fn tenant_query(event: &Event, tenant_id: &str, ts: &str) -> Query {
        let mut cypher = String::from(
            "MATCH (e:Event {event_id: $event_id}) \
             MERGE (t:Tenant {tenant_id: $key}) \
             ON CREATE SET t.first_seen = datetime($ts), t.last_seen = datetime($ts) \
             ON MATCH SET \
               t.first_seen = CASE WHEN datetime($ts) < t.first_seen \
                 THEN datetime($ts) ELSE t.first_seen END, \
               t.last_seen = CASE WHEN datetime($ts) > t.last_seen \
                 THEN datetime($ts) ELSE t.last_seen END \
             MERGE (e)-[r:TARGETED_TENANT]->(t) \
             SET r.path = $path",
        );
        if event.query.is_some() {
            cypher.push_str(", r.query = $query");
        }

        let mut q = query(&cypher)
            .param("event_id", event.event_id.as_str())
            .param("key", tenant_id)
            .param("ts", ts)
            .param("path", event.path.as_str());
        if let Some(query_string) = &event.query {
            q = q.param("query", query_string.as_str());
        }
        q
    }

    /// Links the event to its in-session predecessor: the latest earlier
    /// event in the same session, event_id breaking timestamp ties.
    ///
    /// The predecessor is resolved against whatever is in the store at
    /// write time. An event that arrives in a later batch than one of its
    /// in-session successors (multiple gateways publishing the same
    /// session) links to the same predecessor that successor already chose,
    /// forking the chain rather than splicing into it. Timestamp-ordered
    /// traversal remains correct either way, so forks are accepted.
    fn chain_query(event_id: &str, session_id: &str) -> Query {
        query(
            "MATCH (e:Event {event_id: $event_id}) \
             MATCH (prev:Event)-[:IN_SESSION]->(:Session {session_id: $session_id}) \
             WHERE prev.timestamp < e.timestamp \
               OR (prev.timestamp = e.timestamp AND prev.event_id < e.event_id) \
             WITH e, prev ORDER BY prev.timestamp DESC, prev.event_id DESC LIMIT 1 \
             MERGE (prev)-[:NEXT_EVENT]->(e)",
        )
        .param("event_id", event_id)
        .param("session_id", session_id)
    }
}

enum IdentityKey<'a> {
    Str(&'a str),
    Int(i64),
}

#[async_trait]
impl GraphStore for Neo4jStore {
    async fn ensure_schema(&self) -> AppResult<()> {
        for statement in SCHEMA_STATEMENTS {
            self.graph.run(query(statement)).await?;
        }
        tracing::info!("Graph schema constraints and indexes are in place");
        Ok(())
    }

    async fn write_batch(&self, events: &[Event]) -> AppResult<()> {
        // The consumer retains and retries a failed batch, so database
        // failures on this path surface as GraphWrite rather than raw
        // driver errors.
        self.run_batch(events).await.map_err(|e| match e {
            AppError::Neo4j(e) => AppError::GraphWrite(e.to_string()),
            other => other,
        })
    }

    async fn archive_events(&self, cutoff: DateTime<Utc>) -> AppResult<u64> {
        let q = query(
            "MATCH (e:Event) \
             WHERE e.archived = false AND e.timestamp < datetime($cutoff) \
             SET e.archived = true \
             RETURN count(e) AS archived",
        )
        .param("cutoff", rfc3339(cutoff));

        let mut rows = self.graph.execute(q).await?;
        let mut archived = 0u64;
        while let Some(row) = rows.next().await? {
            archived = row.get::<i64>("archived").map_err(decode_err)? as u64;
        }
        Ok(archived)
    }

    async fn purge_events(&self, cutoff: DateTime<Utc>) -> AppResult<u64> {
        let q = query(
            "MATCH (e:Event) WHERE e.timestamp < datetime($cutoff) \
             DETACH DELETE e \
             RETURN count(e) AS purged",
        )
        .param("cutoff", rfc3339(cutoff));

        let mut rows = self.graph.execute(q).await?;
        let mut purged = 0u64;
        while let Some(row) = rows.next().await? {
            purged = row.get::<i64>("purged").map_err(decode_err)? as u64;
        }

        // Identity nodes referenced by no remaining events are dead weight
        for prune in [
            "MATCH (ip:IPAddress) WHERE NOT (ip)<-[:ORIGINATED_FROM]-() DELETE ip",
            "MATCH (s:Session) WHERE NOT (s)<-[:IN_SESSION]-() DELETE s",
            "MATCH (u:User) WHERE NOT (u)<-[:PERFORMED_BY]-() DELETE u",
            "MATCH (t:Tenant) WHERE NOT (t)<-[:TARGETED_TENANT]-() DELETE t",
        ] {
            self.graph.run(query(prune)).await?;
        }

        Ok(purged)
    }

    async fn failed_validations_by_ip(
        &self,
        window: Window,
        threshold: u64,
    ) -> AppResult<Vec<IpActivity>> {
        let cypher = format!(
            "MATCH (e:Event)-[:ORIGINATED_FROM]->(ip:IPAddress) \
             WHERE e.action = 'token-validated' AND e.status = 'fail' AND {LIVE} \
             WITH ip.address AS address, count(e) AS count \
             WHERE count >= $threshold \
             RETURN address, count ORDER BY count DESC, address ASC"
        );
        self.collect_ip_activity(&cypher, window, threshold).await
    }

    async fn request_volume_by_ip(
        &self,
        window: Window,
        threshold: u64,
    ) -> AppResult<Vec<IpActivity>> {
        let cypher = format!(
            "MATCH (e:Event)-[:ORIGINATED_FROM]->(ip:IPAddress) \
             WHERE {LIVE} \
             WITH ip.address AS address, count(e) AS count \
             WHERE count >= $threshold \
             RETURN address, count ORDER BY count DESC, address ASC"
        );
        self.collect_ip_activity(&cypher, window, threshold).await
    }

    async fn sessions_with_multiple_users(
        &self,
        window: Window,
    ) -> AppResult<Vec<SharedSession>> {
        let cypher = format!(
            "MATCH (u:User)<-[:PERFORMED_BY]-(e:Event)-[:IN_SESSION]->(s:Session) \
             WHERE {LIVE} \
             WITH s.session_id AS session_id, collect(DISTINCT u.user_id) AS user_ids \
             WHERE size(user_ids) > 1 \
             RETURN session_id, user_ids \
             ORDER BY size(user_ids) DESC, session_id ASC"
        );
        let q = query(&cypher)
            .param("since", rfc3339(window.since))
            .param("until", rfc3339(window.until));

        let mut rows = self.graph.execute(q).await?;
        let mut shared = Vec::new();
        while let Some(row) = rows.next().await? {
            let mut user_ids: Vec<i64> = row.get("user_ids").map_err(decode_err)?;
            user_ids.sort_unstable();
            shared.push(SharedSession {
                session_id: row.get("session_id").map_err(decode_err)?,
                user_ids,
            });
        }
        Ok(shared)
    }

    async fn tokens_with_multiple_identities(
        &self,
        window: Window,
    ) -> AppResult<Vec<TokenReuse>> {
        let cypher = format!(
            "MATCH (e:Event) \
             WHERE e.token_id IS NOT NULL AND {LIVE} \
             WITH e.token_id AS token_id, \
                  count(DISTINCT e.user_id) AS user_count, \
                  count(DISTINCT e.tenant_id) AS tenant_count \
             WHERE user_count > 1 OR tenant_count > 1 \
             RETURN token_id, user_count, tenant_count \
             ORDER BY user_count + tenant_count DESC, token_id ASC"
        );
        let q = query(&cypher)
            .param("since", rfc3339(window.since))
            .param("until", rfc3339(window.until));

        let mut rows = self.graph.execute(q).await?;
        let mut reused = Vec::new();
        while let Some(row) = rows.next().await? {
            reused.push(TokenReuse {
                token_id: row.get("token_id").map_err(decode_err)?,
                user_count: row.get::<i64>("user_count").map_err(decode_err)? as u64,
                tenant_count: row.get::<i64>("tenant_count").map_err(decode_err)? as u64,
            });
        }
        Ok(reused)
    }

    async fn ips_issuing_without_conversion(
        &self,
        window: Window,
        threshold: u64,
    ) -> AppResult<Vec<IpActivity>> {
        let cypher = format!(
            "MATCH (e:Event)-[:ORIGINATED_FROM]->(ip:IPAddress) \
             WHERE {LIVE} \
             WITH ip.address AS address, \
                  sum(CASE WHEN e.action = 'token-issued' THEN 1 ELSE 0 END) AS issued, \
                  sum(CASE WHEN e.action = 'token-validated' AND e.status = 'pass' \
                      THEN 1 ELSE 0 END) AS converted \
             WHERE issued >= $threshold AND converted = 0 \
             RETURN address, issued AS count ORDER BY count DESC, address ASC"
        );
        self.collect_ip_activity(&cypher, window, threshold).await
    }

    async fn targeted_paths_for_tenant(
        &self,
        window: Window,
        tenant_id: &str,
        limit: usize,
    ) -> AppResult<Vec<PathHits>> {
        let cypher = format!(
            "MATCH (e:Event)-[:TARGETED_TENANT]->(:Tenant {{tenant_id: $tenant_id}}) \
             WHERE e.action = 'token-validated' AND e.status = 'fail' AND {LIVE} \
             WITH e.path AS path, count(e) AS count \
             RETURN path, count ORDER BY count DESC, path ASC \
             LIMIT $limit"
        );
        let q = query(&cypher)
            .param("tenant_id", tenant_id)
            .param("since", rfc3339(window.since))
            .param("until", rfc3339(window.until))
            .param("limit", limit as i64);

        let mut rows = self.graph.execute(q).await?;
        let mut paths = Vec::new();
        while let Some(row) = rows.next().await? {
            paths.push(PathHits {
                path: row.get("path").map_err(decode_err)?,
                count: row.get::<i64>("count").map_err(decode_err)? as u64,
            });
        }
        Ok(paths)
    }
}

impl Neo4jStore {
    async fn run_batch(&self, events: &[Event]) -> AppResult<()> {
        let mut txn = self.graph.start_txn().await?;

        for event in events {
            let ts = rfc3339(event.timestamp);

            txn.run(Self::event_query(event)?).await?;
            txn.run(Self::identity_query(
                "IPAddress",
                "address",
                "ORIGINATED_FROM",
                &event.event_id,
                IdentityKey::Str(&event.client_ip),
                &ts,
            ))
            .await?;
            if let Some(session_id) = &event.session_id {
                txn.run(Self::identity_query(
                    "Session",
                    "session_id",
                    "IN_SESSION",
                    &event.event_id,
                    IdentityKey::Str(session_id),
                    &ts,
                ))
                .await?;
            }
            if let Some(user_id) = event.user_id {
                txn.run(Self::identity_query(
                    "User",
                    "user_id",
                    "PERFORMED_BY",
                    &event.event_id,
                    IdentityKey::Int(user_id),
                    &ts,
                ))
                .await?;
            }
            if let Some(tenant_id) = &event.tenant_id {
                txn.run(Self::tenant_query(event, tenant_id, &ts)).await?;
            }
            if let Some(session_id) = &event.session_id {
                txn.run(Self::chain_query(&event.event_id, session_id))
                    .await?;
            }
        }

        txn.commit().await?;
        Ok(())
    }

    async fn collect_ip_activity(
        &self,
        cypher: &str,
        window: Window,
        threshold: u64,
    ) -> AppResult<Vec<IpActivity>> {
        let q = query(cypher)
            .param("since", rfc3339(window.since))
            .param("until", rfc3339(window.until))
            .param("threshold", threshold as i64);

        let mut rows = self.graph.execute(q).await?;
        let mut ips = Vec::new();
        while let Some(row) = rows.next().await? {
            ips.push(IpActivity {
                address: row.get("address").map_err(decode_err)?,
                count: row.get::<i64>("count").map_err(decode_err)? as u64,
            });
        }
        Ok(ips)
    }
}
