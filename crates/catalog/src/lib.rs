//! Persisted catalog: the materialized view of every connector's committed
//! records, plus the durable operation log it is replayed from.
//!
//! All state lives in Postgres; nothing here is in-memory-only. Reads apply
//! the visibility rule (live connector, or connector id present in the
//! caller's capped override context) and page on a stable insertion-derived
//! key so pages do not shift across requests on an unmodified catalog.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::postgres::{PgConnection, PgPoolOptions};
use sqlx::{PgPool, Row};

use tributary_contracts::{BrokerError, SessionMode};

pub mod log;

/// Override ids beyond this cap are truncated, not rejected.
pub const CONNECTOR_CONTEXT_CAP: usize = 16;

pub const DEFAULT_PAGE_SIZE: i64 = 20;
pub const MAX_PAGE_SIZE: i64 = 100;

pub(crate) fn internal_error(err: sqlx::Error) -> BrokerError {
    BrokerError::internal(format!("catalog storage error: {}", err))
}

/// Durable open-session marker on a connector. Only the session manager
/// mutates it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    pub session_id: String,
    pub mode: SessionMode,
    pub started_at: DateTime<Utc>,
}

/// Connector row joined with its entity registration.
#[derive(Debug, Clone)]
pub struct ConnectorRow {
    pub connector_id: String,
    pub connector_slug: String,
    pub entity_slug: String,
    pub is_live: bool,
    pub session: Option<SessionHandle>,
    pub schema: serde_json::Value,
    pub timeseries: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CatalogRecord {
    pub connector_id: String,
    pub public_id: String,
    pub vendor_id: String,
    pub document: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub limit: i64,
    pub offset: i64,
}

impl Page {
    pub fn clamped(limit: Option<i64>, offset: Option<i64>) -> Self {
        let limit = limit
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE);
        let offset = offset.unwrap_or(0).max(0);
        Self { limit, offset }
    }
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: DEFAULT_PAGE_SIZE,
            offset: 0,
        }
    }
}

/// Read-side parameters for `query` and its specializations. `segment_sql`
/// is a fragment already compiled by the query translator; it is the only
/// non-bind piece of the statement and is never raw client text.
#[derive(Debug, Clone)]
pub struct QueryParams<'a> {
    pub segment_sql: &'a str,
    pub connector_context: &'a [String],
    pub type_filter: Option<&'a str>,
    pub id_filter: Option<&'a str>,
    pub page: Page,
}

impl<'a> QueryParams<'a> {
    pub fn new(segment_sql: &'a str) -> Self {
        Self {
            segment_sql,
            connector_context: &[],
            type_filter: None,
            id_filter: None,
            page: Page::default(),
        }
    }
}

#[derive(Clone)]
pub struct CatalogStore {
    pool: PgPool,
    write_timeout: Duration,
}

impl CatalogStore {
    pub async fn connect(db_url: &str, write_timeout: Duration) -> Result<Self, BrokerError> {
        let pool = tokio::time::timeout(
            Duration::from_secs(2),
            PgPoolOptions::new().max_connections(8).connect(db_url),
        )
        .await
        .map_err(|_| BrokerError::internal("catalog database connect timed out"))?
        .map_err(internal_error)?;

        Ok(Self {
            pool,
            write_timeout,
        })
    }

    pub async fn connect_and_migrate(
        db_url: &str,
        write_timeout: Duration,
    ) -> Result<Self, BrokerError> {
        let store = Self::connect(db_url, write_timeout).await?;
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<(), BrokerError> {
        tokio::time::timeout(Duration::from_secs(10), migrate(&self.pool))
            .await
            .map_err(|_| BrokerError::internal("catalog migration timed out"))?
            .map_err(|err| BrokerError::internal(format!("catalog migration failed: {}", err)))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn write_timeout(&self) -> Duration {
        self.write_timeout
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn timed<T, F>(&self, fut: F) -> Result<T, BrokerError>
    where
        F: Future<Output = Result<T, BrokerError>>,
    {
        tokio::time::timeout(self.write_timeout, fut)
            .await
            .map_err(|_| BrokerError::internal("catalog operation timed out"))?
    }

    // ---- registry surface (entity/connector CRUD proper is out of scope;
    // these are the minimal seeding/ops hooks the core and tests consume) ----

    pub async fn register_entity(
        &self,
        entity_slug: &str,
        schema: &serde_json::Value,
        timeseries: &serde_json::Value,
    ) -> Result<(), BrokerError> {
        self.timed(async {
            sqlx::query(
                "INSERT INTO trib_entities (entity_slug, schema_json, timeseries_json) \
                 VALUES ($1, $2, $3) \
                 ON CONFLICT (entity_slug) DO UPDATE \
                 SET schema_json = EXCLUDED.schema_json, timeseries_json = EXCLUDED.timeseries_json",
            )
            .bind(entity_slug)
            .bind(schema)
            .bind(timeseries)
            .execute(&self.pool)
            .await
            .map_err(internal_error)?;
            Ok(())
        })
        .await
    }

    pub async fn register_connector(
        &self,
        connector_id: &str,
        connector_slug: &str,
        entity_slug: &str,
        is_live: bool,
    ) -> Result<(), BrokerError> {
        self.timed(async {
            sqlx::query(
                "INSERT INTO trib_connectors (connector_id, connector_slug, entity_slug, is_live) \
                 VALUES ($1, $2, $3, $4) \
                 ON CONFLICT (connector_id) DO UPDATE \
                 SET connector_slug = EXCLUDED.connector_slug, \
                     entity_slug = EXCLUDED.entity_slug, \
                     is_live = EXCLUDED.is_live",
            )
            .bind(connector_id)
            .bind(connector_slug)
            .bind(entity_slug)
            .bind(is_live)
            .execute(&self.pool)
            .await
            .map_err(internal_error)?;
            Ok(())
        })
        .await
    }

    pub async fn set_live(&self, connector_id: &str, is_live: bool) -> Result<(), BrokerError> {
        self.timed(async {
            let result = sqlx::query("UPDATE trib_connectors SET is_live = $1 WHERE connector_id = $2")
                .bind(is_live)
                .bind(connector_id)
                .execute(&self.pool)
                .await
                .map_err(internal_error)?;
            if result.rows_affected() == 0 {
                return Err(BrokerError::not_found("connector", connector_id));
            }
            Ok(())
        })
        .await
    }

    pub async fn load_connector(
        &self,
        connector_id: &str,
    ) -> Result<Option<ConnectorRow>, BrokerError> {
        let mut conn = self.pool.acquire().await.map_err(internal_error)?;
        load_connector(&mut *conn, connector_id).await
    }

    // ---- record mutation ----

    pub async fn upsert(
        &self,
        connector_id: &str,
        public_id: &str,
        vendor_id: &str,
        document: &serde_json::Value,
    ) -> Result<(), BrokerError> {
        self.timed(async {
            let mut conn = self.pool.acquire().await.map_err(internal_error)?;
            upsert_record(&mut *conn, connector_id, public_id, vendor_id, document).await
        })
        .await
    }

    pub async fn delete(&self, connector_id: &str, vendor_id: &str) -> Result<(), BrokerError> {
        self.timed(async {
            let mut conn = self.pool.acquire().await.map_err(internal_error)?;
            delete_record(&mut *conn, connector_id, vendor_id).await
        })
        .await
    }

    pub async fn wipe(&self, connector_id: &str) -> Result<u64, BrokerError> {
        self.timed(async {
            let mut conn = self.pool.acquire().await.map_err(internal_error)?;
            wipe_connector(&mut *conn, connector_id).await
        })
        .await
    }

    // ---- read side ----

    pub async fn query(&self, params: QueryParams<'_>) -> Result<Vec<CatalogRecord>, BrokerError> {
        let context = truncate_context(params.connector_context);
        let sql = build_query_sql(
            params.segment_sql,
            params.type_filter.is_some(),
            params.id_filter.is_some(),
        );

        let mut q = sqlx::query(&sql).bind(&context);
        if let Some(entity_slug) = params.type_filter {
            q = q.bind(entity_slug);
        }
        if let Some(public_id) = params.id_filter {
            q = q.bind(public_id);
        }
        q = q.bind(params.page.limit).bind(params.page.offset);

        let rows = q.fetch_all(&self.pool).await.map_err(internal_error)?;
        rows.into_iter().map(record_from_row).collect()
    }

    /// Distinct entity types currently visible to the caller.
    pub async fn types(
        &self,
        segment_sql: &str,
        connector_context: &[String],
    ) -> Result<Vec<String>, BrokerError> {
        let context = truncate_context(connector_context);
        let sql = build_types_sql(segment_sql);

        let rows = sqlx::query(&sql)
            .bind(&context)
            .fetch_all(&self.pool)
            .await
            .map_err(internal_error)?;

        rows.into_iter()
            .map(|row| row.try_get::<String, _>("entity_slug").map_err(internal_error))
            .collect()
    }

    /// All visible instances of one entity type.
    pub async fn list(
        &self,
        segment_sql: &str,
        connector_context: &[String],
        entity_slug: &str,
        page: Page,
    ) -> Result<Vec<CatalogRecord>, BrokerError> {
        self.query(QueryParams {
            segment_sql,
            connector_context,
            type_filter: Some(entity_slug),
            id_filter: None,
            page,
        })
        .await
    }

    /// One visible instance by public id.
    pub async fn find(
        &self,
        segment_sql: &str,
        connector_context: &[String],
        public_id: &str,
    ) -> Result<Option<CatalogRecord>, BrokerError> {
        let records = self
            .query(QueryParams {
                segment_sql,
                connector_context,
                type_filter: None,
                id_filter: Some(public_id),
                page: Page {
                    limit: 1,
                    offset: 0,
                },
            })
            .await?;
        Ok(records.into_iter().next())
    }
}

pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

/// Loads a connector with its entity's schema and timeseries registration.
pub async fn load_connector(
    conn: &mut PgConnection,
    connector_id: &str,
) -> Result<Option<ConnectorRow>, BrokerError> {
    let row = sqlx::query(
        "SELECT c.connector_id, c.connector_slug, c.entity_slug, c.is_live, \
                c.session_id, c.session_mode, c.session_started_at, \
                e.schema_json, e.timeseries_json \
         FROM trib_connectors c \
         JOIN trib_entities e ON e.entity_slug = c.entity_slug \
         WHERE c.connector_id = $1",
    )
    .bind(connector_id)
    .fetch_optional(conn)
    .await
    .map_err(internal_error)?;

    let Some(row) = row else {
        return Ok(None);
    };

    let session_id: Option<String> = row.try_get("session_id").map_err(internal_error)?;
    let session = match session_id {
        Some(session_id) => {
            let mode_token: String = row.try_get("session_mode").map_err(internal_error)?;
            let mode = SessionMode::parse(&mode_token).map_err(|_| {
                BrokerError::internal(format!(
                    "connector row carries unknown session mode `{}`",
                    mode_token
                ))
            })?;
            Some(SessionHandle {
                session_id,
                mode,
                started_at: row.try_get("session_started_at").map_err(internal_error)?,
            })
        }
        None => None,
    };

    Ok(Some(ConnectorRow {
        connector_id: row.try_get("connector_id").map_err(internal_error)?,
        connector_slug: row.try_get("connector_slug").map_err(internal_error)?,
        entity_slug: row.try_get("entity_slug").map_err(internal_error)?,
        is_live: row.try_get("is_live").map_err(internal_error)?,
        session,
        schema: row.try_get("schema_json").map_err(internal_error)?,
        timeseries: row.try_get("timeseries_json").map_err(internal_error)?,
    }))
}

/// Insert-or-replace keyed by (connector_id, vendor_id). Idempotent; the
/// insertion-derived `ord` and `created_at` survive replacement, and the
/// public id never drifts because it is a pure function of the key.
pub async fn upsert_record(
    conn: &mut PgConnection,
    connector_id: &str,
    public_id: &str,
    vendor_id: &str,
    document: &serde_json::Value,
) -> Result<(), BrokerError> {
    sqlx::query(
        "INSERT INTO trib_catalog_records (connector_id, public_id, vendor_id, document) \
         VALUES ($1, $2, $3, $4) \
         ON CONFLICT (connector_id, vendor_id) DO UPDATE \
         SET document = EXCLUDED.document, updated_at = now()",
    )
    .bind(connector_id)
    .bind(public_id)
    .bind(vendor_id)
    .bind(document)
    .execute(conn)
    .await
    .map_err(internal_error)?;
    Ok(())
}

/// Absent-record delete is a no-op success, not an error.
pub async fn delete_record(
    conn: &mut PgConnection,
    connector_id: &str,
    vendor_id: &str,
) -> Result<(), BrokerError> {
    sqlx::query("DELETE FROM trib_catalog_records WHERE connector_id = $1 AND vendor_id = $2")
        .bind(connector_id)
        .bind(vendor_id)
        .execute(conn)
        .await
        .map_err(internal_error)?;
    Ok(())
}

pub async fn wipe_connector(
    conn: &mut PgConnection,
    connector_id: &str,
) -> Result<u64, BrokerError> {
    let result = sqlx::query("DELETE FROM trib_catalog_records WHERE connector_id = $1")
        .bind(connector_id)
        .execute(conn)
        .await
        .map_err(internal_error)?;
    Ok(result.rows_affected())
}

/// Caps the visibility override list by truncation.
pub fn truncate_context(context: &[String]) -> Vec<String> {
    let mut truncated = context.to_vec();
    if truncated.len() > CONNECTOR_CONTEXT_CAP {
        tracing::warn!(
            supplied = truncated.len(),
            cap = CONNECTOR_CONTEXT_CAP,
            "connector override context truncated"
        );
        truncated.truncate(CONNECTOR_CONTEXT_CAP);
    }
    truncated
}

fn build_query_sql(segment_sql: &str, type_filter: bool, id_filter: bool) -> String {
    let mut sql = String::from(
        "SELECT r.connector_id, r.public_id, r.vendor_id, r.document, r.created_at, r.updated_at \
         FROM trib_catalog_records r \
         JOIN trib_connectors c ON c.connector_id = r.connector_id \
         WHERE (",
    );
    sql.push_str(segment_sql);
    sql.push_str(") AND (c.is_live OR r.connector_id = ANY($1))");

    let mut idx = 2;
    if type_filter {
        sql.push_str(" AND c.entity_slug = $");
        sql.push_str(&idx.to_string());
        idx += 1;
    }
    if id_filter {
        sql.push_str(" AND r.public_id = $");
        sql.push_str(&idx.to_string());
        idx += 1;
    }

    sql.push_str(" ORDER BY r.ord ASC LIMIT $");
    sql.push_str(&idx.to_string());
    sql.push_str(" OFFSET $");
    sql.push_str(&(idx + 1).to_string());
    sql
}

fn build_types_sql(segment_sql: &str) -> String {
    let mut sql = String::from(
        "SELECT DISTINCT c.entity_slug \
         FROM trib_catalog_records r \
         JOIN trib_connectors c ON c.connector_id = r.connector_id \
         WHERE (",
    );
    sql.push_str(segment_sql);
    sql.push_str(") AND (c.is_live OR r.connector_id = ANY($1)) ORDER BY c.entity_slug ASC");
    sql
}

fn record_from_row(row: sqlx::postgres::PgRow) -> Result<CatalogRecord, BrokerError> {
    Ok(CatalogRecord {
        connector_id: row.try_get("connector_id").map_err(internal_error)?,
        public_id: row.try_get("public_id").map_err(internal_error)?,
        vendor_id: row.try_get("vendor_id").map_err(internal_error)?,
        document: row.try_get("document").map_err(internal_error)?,
        created_at: row.try_get("created_at").map_err(internal_error)?,
        updated_at: row.try_get("updated_at").map_err(internal_error)?,
    })
}
