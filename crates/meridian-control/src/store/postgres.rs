//! PostgreSQL store implementation.
//!
//! Hosts, agents and host tags live in plain tables because the retirement
//! queries join them. Work items and the slower-moving configuration records
//! (clusters, environments, deploys, builds) are stored as JSONB documents
//! keyed by kind and id.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;

use crate::agents::AgentRegistry;
use crate::config::DatabaseConfig;
use crate::error::{ControlError, ControlResult};
use crate::item::{ItemState, WorkItem};
use crate::types::{
    AcceptanceStatus, Agent, Build, Cluster, ClusterState, Deploy, DeployConstraint, DeployState,
    EnvId, Environment, Host, HostId, HostState, HostTag, Image, ItemId, PromoteConfig,
    PromoteKind, TagSyncState,
};

use super::{DeployStore, FleetStore, NewDeploy, TagStore, WorkItemStore};

/// Agent predicate matching [`Agent::is_failed`].
const AGENT_FAILED: &str = "a.deploy_stage <> 'SERVING_BUILD' \
     AND a.status NOT IN ('SUCCEEDED', 'UNKNOWN', 'SCRIPT_FAILED')";

const HOST_NOT_LEAVING: &str = "h.state NOT IN ('PENDING_TERMINATE', 'TERMINATING')";

/// A configuration record stored as a JSONB document.
pub trait Document: Serialize + DeserializeOwned + Send + Sync {
    const KIND: &'static str;

    fn key(&self) -> String;
}

impl Document for Cluster {
    const KIND: &'static str = "cluster";

    fn key(&self) -> String {
        self.name.clone()
    }
}

impl Document for Environment {
    const KIND: &'static str = "environment";

    fn key(&self) -> String {
        self.id.to_string()
    }
}

impl Document for Image {
    const KIND: &'static str = "image";

    fn key(&self) -> String {
        self.id.clone()
    }
}

impl Document for Deploy {
    const KIND: &'static str = "deploy";

    fn key(&self) -> String {
        self.id.clone()
    }
}

impl Document for Build {
    const KIND: &'static str = "build";

    fn key(&self) -> String {
        self.id.clone()
    }
}

impl Document for PromoteConfig {
    const KIND: &'static str = "promote_config";

    fn key(&self) -> String {
        self.env_id.to_string()
    }
}

impl Document for DeployConstraint {
    const KIND: &'static str = "deploy_constraint";

    fn key(&self) -> String {
        self.id.clone()
    }
}

/// PostgreSQL-backed store.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect to PostgreSQL and create a new store.
    ///
    /// The required tables are created if they don't exist.
    pub async fn new(config: &DatabaseConfig) -> ControlResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .connect(&config.url)
            .await?;

        Self::from_pool(pool).await
    }

    /// Create a store from an existing connection pool.
    pub async fn from_pool(pool: PgPool) -> ControlResult<Self> {
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Connection pool shared with the advisory lock backend.
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn ensure_schema(&self) -> ControlResult<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS work_items (
                kind TEXT NOT NULL,
                id TEXT NOT NULL,
                owner TEXT NOT NULL,
                state TEXT NOT NULL,
                body JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (kind, id)
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_work_items_state
            ON work_items (kind, state)
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_work_items_owner
            ON work_items (kind, owner, created_at DESC)
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                kind TEXT NOT NULL,
                id TEXT NOT NULL,
                body JSONB NOT NULL,
                PRIMARY KEY (kind, id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS hosts (
                id TEXT PRIMARY KEY,
                cluster TEXT NOT NULL,
                state TEXT NOT NULL,
                retirable BOOLEAN NOT NULL DEFAULT FALSE,
                last_update TIMESTAMPTZ NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_hosts_cluster
            ON hosts (cluster, state)
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS agents (
                host_id TEXT NOT NULL,
                env_id TEXT NOT NULL,
                deploy_stage TEXT NOT NULL,
                status TEXT NOT NULL,
                state TEXT NOT NULL,
                deploy_start TIMESTAMPTZ,
                first_deploy_time TIMESTAMPTZ,
                last_update TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (host_id, env_id)
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_agents_env
            ON agents (env_id, deploy_stage)
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS host_tags (
                host_id TEXT NOT NULL,
                env_id TEXT NOT NULL,
                tag_name TEXT NOT NULL,
                tag_value TEXT,
                PRIMARY KEY (host_id, env_id, tag_name)
            )
            "#,
        ];

        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        Ok(())
    }

    /// Insert or replace a configuration document.
    pub async fn put<D: Document>(&self, doc: &D) -> ControlResult<()> {
        sqlx::query(
            r#"
            INSERT INTO documents (kind, id, body) VALUES ($1, $2, $3)
            ON CONFLICT (kind, id) DO UPDATE SET body = EXCLUDED.body
            "#,
        )
        .bind(D::KIND)
        .bind(doc.key())
        .bind(encode(doc)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_document<D: Document>(&self, id: &str) -> ControlResult<Option<D>> {
        let row = sqlx::query("SELECT body FROM documents WHERE kind = $1 AND id = $2")
            .bind(D::KIND)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| decode(row.get("body"))).transpose()
    }

    /// Set one top-level field of a document, failing if it does not exist.
    async fn set_document_field(
        &self,
        kind: &'static str,
        id: &str,
        field: &str,
        value: serde_json::Value,
    ) -> ControlResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE documents SET body = jsonb_set(body, ARRAY[$3], $4)
            WHERE kind = $1 AND id = $2
            "#,
        )
        .bind(kind)
        .bind(id)
        .bind(field)
        .bind(value)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ControlError::not_found(kind, id));
        }
        Ok(())
    }

    async fn host_ids(&self, sql: &str, cluster: &str) -> ControlResult<Vec<HostId>> {
        let rows = sqlx::query(sql).bind(cluster).fetch_all(&self.pool).await?;
        Ok(rows
            .iter()
            .map(|row| HostId::new(row.get::<String, _>("id")))
            .collect())
    }

    /// Upsert an agent report.
    pub async fn upsert_agent(&self, agent: &Agent) -> ControlResult<()> {
        sqlx::query(
            r#"
            INSERT INTO agents (host_id, env_id, deploy_stage, status, state,
                                deploy_start, first_deploy_time, last_update)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (host_id, env_id) DO UPDATE SET
                deploy_stage = EXCLUDED.deploy_stage,
                status = EXCLUDED.status,
                state = EXCLUDED.state,
                deploy_start = EXCLUDED.deploy_start,
                first_deploy_time = EXCLUDED.first_deploy_time,
                last_update = EXCLUDED.last_update
            "#,
        )
        .bind(agent.host_id.as_str())
        .bind(agent.env_id.as_str())
        .bind(agent.deploy_stage.as_str())
        .bind(agent.status.as_str())
        .bind(agent.state.as_str())
        .bind(agent.deploy_start)
        .bind(agent.first_deploy_time)
        .bind(agent.last_update)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn encode<T: Serialize>(value: &T) -> ControlResult<serde_json::Value> {
    serde_json::to_value(value)
        .map_err(|e| ControlError::Serialisation(format!("failed to serialise record: {e}")))
}

fn decode<T: DeserializeOwned>(value: serde_json::Value) -> ControlResult<T> {
    serde_json::from_value(value)
        .map_err(|e| ControlError::Serialisation(format!("failed to deserialise record: {e}")))
}

fn parse<T: std::str::FromStr<Err = String>>(row: &PgRow, column: &str) -> ControlResult<T> {
    let raw: String = row.get(column);
    raw.parse()
        .map_err(|e| ControlError::Serialisation(format!("column {column}: {e}")))
}

fn string_ids(ids: &[HostId]) -> Vec<String> {
    ids.iter().map(|id| id.as_str().to_owned()).collect()
}

fn to_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn row_to_host(row: &PgRow) -> ControlResult<Host> {
    Ok(Host {
        id: HostId::new(row.get::<String, _>("id")),
        cluster: row.get("cluster"),
        state: parse(row, "state")?,
        retirable: row.get("retirable"),
        last_update: row.get("last_update"),
        created_at: row.get("created_at"),
    })
}

fn row_to_agent(row: &PgRow) -> ControlResult<Agent> {
    Ok(Agent {
        host_id: HostId::new(row.get::<String, _>("host_id")),
        env_id: EnvId::new(row.get::<String, _>("env_id")),
        deploy_stage: parse(row, "deploy_stage")?,
        status: parse(row, "status")?,
        state: parse(row, "state")?,
        deploy_start: row.get("deploy_start"),
        first_deploy_time: row.get("first_deploy_time"),
        last_update: row.get("last_update"),
    })
}

#[async_trait]
impl<T: WorkItem> WorkItemStore<T> for PostgresStore {
    async fn insert(&self, item: &T) -> ControlResult<()> {
        sqlx::query(
            r#"
            INSERT INTO work_items (kind, id, owner, state, body, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(T::KIND)
        .bind(item.id().as_str())
        .bind(item.owner())
        .bind(item.state().as_str())
        .bind(encode(item)?)
        .bind(item.header().created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: &ItemId) -> ControlResult<Option<T>> {
        let row = sqlx::query("SELECT body FROM work_items WHERE kind = $1 AND id = $2")
            .bind(T::KIND)
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| decode(row.get("body"))).transpose()
    }

    async fn list_ids_in_states(&self, states: &[T::State]) -> ControlResult<Vec<ItemId>> {
        let states: Vec<&str> = states.iter().map(ItemState::as_str).collect();
        let rows = sqlx::query(
            "SELECT id FROM work_items WHERE kind = $1 AND state = ANY($2) ORDER BY id",
        )
        .bind(T::KIND)
        .bind(&states)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| ItemId::new(row.get::<String, _>("id")))
            .collect())
    }

    async fn update(&self, item: &T) -> ControlResult<()> {
        let result = sqlx::query(
            "UPDATE work_items SET state = $3, body = $4 WHERE kind = $1 AND id = $2",
        )
        .bind(T::KIND)
        .bind(item.id().as_str())
        .bind(item.state().as_str())
        .bind(encode(item)?)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ControlError::not_found(T::KIND, item.id()));
        }
        Ok(())
    }

    async fn recent_for_owner(&self, owner: &str, limit: usize) -> ControlResult<Vec<T>> {
        let rows = sqlx::query(
            r#"
            SELECT body FROM work_items
            WHERE kind = $1 AND owner = $2
            ORDER BY created_at DESC
            LIMIT $3
            "#,
        )
        .bind(T::KIND)
        .bind(owner)
        .bind(to_limit(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|row| decode(row.get("body"))).collect()
    }
}

#[async_trait]
impl FleetStore for PostgresStore {
    async fn get_cluster(&self, name: &str) -> ControlResult<Option<Cluster>> {
        self.get_document(name).await
    }

    async fn set_cluster_state(&self, name: &str, state: ClusterState) -> ControlResult<()> {
        self.set_document_field(Cluster::KIND, name, "state", encode(&state)?)
            .await?;
        self.set_document_field(Cluster::KIND, name, "last_update", encode(&Utc::now())?)
            .await
    }

    async fn set_cluster_image(&self, name: &str, image_id: &str) -> ControlResult<()> {
        self.set_document_field(Cluster::KIND, name, "image_id", encode(&image_id)?)
            .await
    }

    async fn get_environment(&self, id: &EnvId) -> ControlResult<Option<Environment>> {
        self.get_document(id.as_str()).await
    }

    async fn environment_by_stage(
        &self,
        name: &str,
        stage: &str,
    ) -> ControlResult<Option<Environment>> {
        let row = sqlx::query(
            r#"
            SELECT body FROM documents
            WHERE kind = $1 AND body->>'name' = $2 AND body->>'stage' = $3
            LIMIT 1
            "#,
        )
        .bind(Environment::KIND)
        .bind(name)
        .bind(stage)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| decode(row.get("body"))).transpose()
    }

    async fn get_image(&self, id: &str) -> ControlResult<Option<Image>> {
        self.get_document(id).await
    }

    async fn get_host(&self, id: &HostId) -> ControlResult<Option<Host>> {
        let row = sqlx::query("SELECT * FROM hosts WHERE id = $1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_host).transpose()
    }

    async fn insert_host(&self, host: &Host) -> ControlResult<()> {
        sqlx::query(
            r#"
            INSERT INTO hosts (id, cluster, state, retirable, last_update, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(host.id.as_str())
        .bind(&host.cluster)
        .bind(host.state.as_str())
        .bind(host.retirable)
        .bind(host.last_update)
        .bind(host.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_host_state(&self, ids: &[HostId], state: HostState) -> ControlResult<()> {
        sqlx::query("UPDATE hosts SET state = $2, last_update = NOW() WHERE id = ANY($1)")
            .bind(string_ids(ids))
            .bind(state.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_host(&self, id: &HostId) -> ControlResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM agents WHERE host_id = $1")
            .bind(id.as_str())
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM hosts WHERE id = $1")
            .bind(id.as_str())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn hosts_in_states(&self, states: &[HostState]) -> ControlResult<Vec<Host>> {
        let states: Vec<&str> = states.iter().map(HostState::as_str).collect();
        let rows = sqlx::query("SELECT * FROM hosts WHERE state = ANY($1) ORDER BY id")
            .bind(&states)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(row_to_host).collect()
    }

    async fn env_host_ids(&self, env_id: &EnvId) -> ControlResult<BTreeSet<HostId>> {
        let rows = sqlx::query("SELECT host_id FROM agents WHERE env_id = $1")
            .bind(env_id.as_str())
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .iter()
            .map(|row| HostId::new(row.get::<String, _>("host_id")))
            .collect())
    }

    async fn retirable_host_ids(&self, cluster: &str) -> ControlResult<Vec<HostId>> {
        let sql = format!(
            "SELECT h.id FROM hosts h WHERE h.cluster = $1 AND h.retirable \
             AND {HOST_NOT_LEAVING} ORDER BY h.id"
        );
        self.host_ids(&sql, cluster).await
    }

    async fn retirable_failed_host_ids(&self, cluster: &str) -> ControlResult<Vec<HostId>> {
        let sql = format!(
            "SELECT DISTINCT h.id FROM hosts h JOIN agents a ON a.host_id = h.id \
             WHERE h.cluster = $1 AND h.retirable AND {HOST_NOT_LEAVING} AND {AGENT_FAILED} \
             ORDER BY h.id"
        );
        self.host_ids(&sql, cluster).await
    }

    async fn failed_host_ids(&self, cluster: &str) -> ControlResult<Vec<HostId>> {
        let sql = format!(
            "SELECT DISTINCT h.id FROM hosts h JOIN agents a ON a.host_id = h.id \
             WHERE h.cluster = $1 AND {HOST_NOT_LEAVING} AND {AGENT_FAILED} \
             ORDER BY h.id"
        );
        self.host_ids(&sql, cluster).await
    }

    async fn drain_hosts(&self, env_id: &EnvId, ids: &[HostId]) -> ControlResult<()> {
        let ids = string_ids(ids);
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE agents SET state = 'STOP' WHERE env_id = $1 AND host_id = ANY($2)")
            .bind(env_id.as_str())
            .bind(&ids)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "UPDATE hosts SET state = 'PENDING_TERMINATE', last_update = NOW() WHERE id = ANY($1)",
        )
        .bind(&ids)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl AgentRegistry for PostgresStore {
    async fn agents_by_host(&self, host: &HostId) -> ControlResult<Vec<Agent>> {
        let rows = sqlx::query("SELECT * FROM agents WHERE host_id = $1 ORDER BY env_id")
            .bind(host.as_str())
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(row_to_agent).collect()
    }

    async fn count_serving(&self, env_id: &EnvId) -> ControlResult<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM agents WHERE env_id = $1 AND deploy_stage = 'SERVING_BUILD'",
        )
        .bind(env_id.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(u64::try_from(count).unwrap_or(0))
    }
}

#[async_trait]
impl DeployStore for PostgresStore {
    async fn get_deploy(&self, id: &str) -> ControlResult<Option<Deploy>> {
        self.get_document(id).await
    }

    async fn get_build(&self, id: &str) -> ControlResult<Option<Build>> {
        self.get_document(id).await
    }

    async fn promote_config(&self, env_id: &EnvId) -> ControlResult<Option<PromoteConfig>> {
        self.get_document(env_id.as_str()).await
    }

    async fn auto_promote_env_ids(&self) -> ControlResult<Vec<EnvId>> {
        let rows = sqlx::query(
            "SELECT id FROM documents WHERE kind = $1 AND body->>'kind' = 'AUTO' ORDER BY id",
        )
        .bind(PromoteConfig::KIND)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| EnvId::new(row.get::<String, _>("id")))
            .collect())
    }

    async fn set_promote_kind(&self, env_id: &EnvId, kind: PromoteKind) -> ControlResult<()> {
        self.set_document_field(PromoteConfig::KIND, env_id.as_str(), "kind", encode(&kind)?)
            .await
    }

    async fn builds_published_between(
        &self,
        name: &str,
        after: DateTime<Utc>,
        before: DateTime<Utc>,
        limit: usize,
    ) -> ControlResult<Vec<Build>> {
        let rows = sqlx::query(
            r#"
            SELECT body FROM documents
            WHERE kind = $1 AND body->>'name' = $2
              AND (body->>'publish_date')::timestamptz > $3
              AND (body->>'publish_date')::timestamptz <= $4
            ORDER BY (body->>'publish_date')::timestamptz DESC
            LIMIT $5
            "#,
        )
        .bind(Build::KIND)
        .bind(name)
        .bind(after)
        .bind(before)
        .bind(to_limit(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|row| decode(row.get("body"))).collect()
    }

    async fn deploys_started_between(
        &self,
        env_id: &EnvId,
        after: DateTime<Utc>,
        before: DateTime<Utc>,
        limit: usize,
    ) -> ControlResult<Vec<Deploy>> {
        let rows = sqlx::query(
            r#"
            SELECT body FROM documents
            WHERE kind = $1 AND body->>'env_id' = $2
              AND (body->>'start_date')::timestamptz > $3
              AND (body->>'start_date')::timestamptz <= $4
            ORDER BY (body->>'start_date')::timestamptz DESC
            LIMIT $5
            "#,
        )
        .bind(Deploy::KIND)
        .bind(env_id.as_str())
        .bind(after)
        .bind(before)
        .bind(to_limit(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|row| decode(row.get("body"))).collect()
    }

    async fn create_deploy(&self, deploy: &NewDeploy) -> ControlResult<Deploy> {
        let record = Deploy {
            id: ulid::Ulid::new().to_string().to_lowercase(),
            env_id: deploy.env_id.clone(),
            build_id: deploy.build_id.clone(),
            state: DeployState::Running,
            acceptance: AcceptanceStatus::PendingDeploy,
            start_date: Utc::now(),
            from_deploy: deploy.from_deploy.clone(),
        };

        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT INTO documents (kind, id, body) VALUES ($1, $2, $3)")
            .bind(Deploy::KIND)
            .bind(&record.id)
            .bind(encode(&record)?)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query(
            r#"
            UPDATE documents SET body = jsonb_set(body, '{deploy_id}', to_jsonb($3::text))
            WHERE kind = $1 AND id = $2
            "#,
        )
        .bind(Environment::KIND)
        .bind(deploy.env_id.as_str())
        .bind(&record.id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(ControlError::not_found("environment", &deploy.env_id));
        }
        tx.commit().await?;
        Ok(record)
    }
}

#[async_trait]
impl TagStore for PostgresStore {
    async fn get_constraint(&self, id: &str) -> ControlResult<Option<DeployConstraint>> {
        self.get_document(id).await
    }

    async fn constraint_ids_in_states(&self, states: &[TagSyncState]) -> ControlResult<Vec<String>> {
        let states: Vec<&str> = states.iter().map(TagSyncState::as_str).collect();
        let rows = sqlx::query(
            "SELECT id FROM documents WHERE kind = $1 AND body->>'state' = ANY($2) ORDER BY id",
        )
        .bind(DeployConstraint::KIND)
        .bind(&states)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(|row| row.get("id")).collect())
    }

    async fn set_constraint_state(&self, id: &str, state: TagSyncState) -> ControlResult<()> {
        self.set_document_field(DeployConstraint::KIND, id, "state", encode(&state)?)
            .await?;
        self.set_document_field(DeployConstraint::KIND, id, "last_update", encode(&Utc::now())?)
            .await
    }

    async fn tagged_host_ids(
        &self,
        env_id: &EnvId,
        tag_name: &str,
    ) -> ControlResult<BTreeSet<HostId>> {
        let rows = sqlx::query("SELECT host_id FROM host_tags WHERE env_id = $1 AND tag_name = $2")
            .bind(env_id.as_str())
            .bind(tag_name)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .iter()
            .map(|row| HostId::new(row.get::<String, _>("host_id")))
            .collect())
    }

    async fn delete_host_tags(
        &self,
        env_id: &EnvId,
        tag_name: &str,
        ids: &[HostId],
    ) -> ControlResult<()> {
        sqlx::query(
            "DELETE FROM host_tags WHERE env_id = $1 AND tag_name = $2 AND host_id = ANY($3)",
        )
        .bind(env_id.as_str())
        .bind(tag_name)
        .bind(string_ids(ids))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_host_tags(&self, tags: &[HostTag]) -> ControlResult<()> {
        let mut tx = self.pool.begin().await?;
        for tag in tags {
            sqlx::query(
                r#"
                INSERT INTO host_tags (host_id, env_id, tag_name, tag_value)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (host_id, env_id, tag_name) DO UPDATE SET tag_value = EXCLUDED.tag_value
                "#,
            )
            .bind(tag.host_id.as_str())
            .bind(tag.env_id.as_str())
            .bind(&tag.tag_name)
            .bind(&tag.tag_value)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

impl std::fmt::Debug for PostgresStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresStore")
            .field("pool_size", &self.pool.size())
            .finish_non_exhaustive()
    }
}
