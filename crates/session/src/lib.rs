//! Contribution session lifecycle.
//!
//! One connector owns at most one open session. `open` starts (or, for an
//! already-open session, discards and restarts) a session in one of three
//! commit modes; `action` appends validated batches to the durable operation
//! log; `close` commits or rolls the buffer back. Replay into the catalog is
//! always strictly in write-time sequence order, serialized per connector by
//! a Postgres advisory transaction lock.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgConnection;
use ulid::Ulid;

use tributary_catalog::log::{self, NewOperation, OperationEntry};
use tributary_catalog::{self as catalog, CatalogStore};
use tributary_contracts::{Action, BatchIssue, BrokerError, RecordDocument, RecordSubmission, SessionMode};
use tributary_identity::IdentityScheme;

/// Collaborator contract for per-record schema validation. The concrete
/// JSON-schema engine lives outside this crate.
pub trait SchemaValidator: Send + Sync {
    /// Returns human-readable problems; empty means the document conforms.
    fn validate(&self, document: &serde_json::Value, schema: &serde_json::Value) -> Vec<String>;
}

/// Validator that accepts every document. Useful where schema enforcement is
/// handled upstream or disabled.
pub struct AcceptAllValidator;

impl SchemaValidator for AcceptAllValidator {
    fn validate(&self, _document: &serde_json::Value, _schema: &serde_json::Value) -> Vec<String> {
        Vec::new()
    }
}

#[derive(Clone)]
pub struct SessionManager {
    store: CatalogStore,
    identity: IdentityScheme,
    validator: Arc<dyn SchemaValidator>,
}

impl SessionManager {
    pub fn new(
        store: CatalogStore,
        identity: IdentityScheme,
        validator: Arc<dyn SchemaValidator>,
    ) -> Self {
        Self {
            store,
            identity,
            validator,
        }
    }

    pub fn identity(&self) -> &IdentityScheme {
        &self.identity
    }

    /// Opens a session. An already-open session on the connector is
    /// discarded (its buffered log entries deleted, never replayed); last
    /// open wins.
    pub async fn open(
        &self,
        connector_id: &str,
        mode: SessionMode,
    ) -> Result<String, BrokerError> {
        self.timed(async {
            let mut tx = self.store.pool().begin().await.map_err(internal)?;
            lock_connector(&mut *tx, connector_id).await?;

            let connector = catalog::load_connector(&mut *tx, connector_id)
                .await?
                .ok_or_else(|| BrokerError::not_found("connector", connector_id))?;

            if let Some(previous) = connector.session {
                let discarded = log::discard_session(&mut *tx, &previous.session_id).await?;
                tracing::warn!(
                    connector_id,
                    previous_session = %previous.session_id,
                    previous_mode = previous.mode.as_str(),
                    discarded_entries = discarded,
                    "open over an active session; prior buffer discarded"
                );
            }

            let session_id = Ulid::new().to_string();
            sqlx::query(
                "UPDATE trib_connectors \
                 SET session_id = $1, session_mode = $2, session_started_at = now() \
                 WHERE connector_id = $3",
            )
            .bind(&session_id)
            .bind(mode.as_str())
            .bind(connector_id)
            .execute(&mut *tx)
            .await
            .map_err(internal)?;

            tx.commit().await.map_err(internal)?;

            tracing::info!(connector_id, session_id = %session_id, mode = mode.as_str(), "session opened");
            Ok(session_id)
        })
        .await
    }

    /// Appends a validated batch to the session's log partition. In STREAM
    /// mode the newly appended entries are replayed immediately, in append
    /// order, and removed from the log (auto-commit per call). Returns the
    /// `vendor id -> public id` acknowledgement map.
    pub async fn action(
        &self,
        connector_id: &str,
        session_id: &str,
        action: Action,
        records: &[RecordSubmission],
    ) -> Result<BTreeMap<String, String>, BrokerError> {
        self.timed(async {
            let mut tx = self.store.pool().begin().await.map_err(internal)?;
            lock_connector(&mut *tx, connector_id).await?;

            let connector = catalog::load_connector(&mut *tx, connector_id)
                .await?
                .ok_or_else(|| BrokerError::not_found("connector", connector_id))?;
            let session = authorize(&connector, session_id)?;

            validate_batch(self.validator.as_ref(), action, records, &connector.schema)?;
            let timeseries = timeseries_map(&connector.timeseries);

            let mut ack = BTreeMap::new();
            let mut appended = Vec::with_capacity(records.len());

            for record in records {
                let public_id = self.identity.public_id(connector_id, &record.id);
                let payload = match action {
                    Action::Upsert => {
                        Some(RecordDocument::from_submission(record, timeseries.clone()).to_value())
                    }
                    Action::Delete => None,
                };

                let sequence = log::append(
                    &mut *tx,
                    NewOperation {
                        session_id,
                        connector_id,
                        public_id: &public_id,
                        vendor_id: &record.id,
                        action,
                        payload: payload.as_ref(),
                    },
                )
                .await?;

                appended.push(OperationEntry {
                    sequence,
                    session_id: session_id.to_string(),
                    connector_id: connector_id.to_string(),
                    public_id: public_id.clone(),
                    vendor_id: record.id.clone(),
                    action,
                    payload,
                });
                ack.insert(record.id.clone(), public_id);
            }

            if session.mode == SessionMode::Stream {
                for entry in &appended {
                    apply_entry(&mut *tx, entry).await?;
                }
                let sequences = appended.iter().map(|e| e.sequence).collect::<Vec<_>>();
                log::delete_sequences(&mut *tx, &sequences).await?;
            }

            tx.commit().await.map_err(internal)?;

            tracing::info!(
                connector_id,
                session_id,
                action = action.as_str(),
                records = records.len(),
                "batch accepted"
            );
            Ok(ack)
        })
        .await
    }

    /// Closes the session. `commit == false` rolls the buffer back
    /// unapplied. `commit == true` replays the buffered entries in sequence
    /// order; REPLACE first wipes the connector's records inside the same
    /// transaction, so readers never observe the connector empty mid-swap.
    /// The open-session marker is cleared either way. Returns the number of
    /// log entries replayed into the catalog.
    pub async fn close(
        &self,
        connector_id: &str,
        session_id: &str,
        commit: bool,
    ) -> Result<u64, BrokerError> {
        self.timed(async {
            let mut tx = self.store.pool().begin().await.map_err(internal)?;
            lock_connector(&mut *tx, connector_id).await?;

            let connector = catalog::load_connector(&mut *tx, connector_id)
                .await?
                .ok_or_else(|| BrokerError::not_found("connector", connector_id))?;
            let session = authorize(&connector, session_id)?;

            let mut replayed = 0_u64;
            if commit {
                if session.mode == SessionMode::Replace {
                    catalog::wipe_connector(&mut *tx, connector_id).await?;
                }
                let entries = log::entries_for_session(&mut *tx, session_id).await?;
                for entry in &entries {
                    apply_entry(&mut *tx, entry).await?;
                }
                replayed = entries.len() as u64;
            }

            log::discard_session(&mut *tx, session_id).await?;
            sqlx::query(
                "UPDATE trib_connectors \
                 SET session_id = NULL, session_mode = NULL, session_started_at = NULL \
                 WHERE connector_id = $1",
            )
            .bind(connector_id)
            .execute(&mut *tx)
            .await
            .map_err(internal)?;

            tx.commit().await.map_err(internal)?;

            tracing::info!(
                connector_id,
                session_id,
                mode = session.mode.as_str(),
                commit,
                replayed,
                "session closed"
            );
            Ok(replayed)
        })
        .await
    }

    async fn timed<T, F>(&self, fut: F) -> Result<T, BrokerError>
    where
        F: std::future::Future<Output = Result<T, BrokerError>>,
    {
        tokio::time::timeout(self.write_budget(), fut)
            .await
            .map_err(|_| BrokerError::internal("session operation timed out"))?
    }

    fn write_budget(&self) -> Duration {
        self.store.write_timeout()
    }
}

fn internal(err: sqlx::Error) -> BrokerError {
    BrokerError::internal(format!("session storage error: {}", err))
}

/// Serializes open/action/close and replay per connector. Connectors remain
/// fully independent units of concurrency.
async fn lock_connector(conn: &mut PgConnection, connector_id: &str) -> Result<(), BrokerError> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
        .bind(connector_id)
        .execute(conn)
        .await
        .map_err(internal)?;
    Ok(())
}

fn authorize<'a>(
    connector: &'a catalog::ConnectorRow,
    session_id: &str,
) -> Result<&'a catalog::SessionHandle, BrokerError> {
    let Some(session) = connector.session.as_ref() else {
        return Err(BrokerError::unauthorized(format!(
            "connector `{}` has no open session",
            connector.connector_id
        )));
    };
    if session.session_id != session_id {
        return Err(BrokerError::unauthorized(
            "session id does not match the connector's open session",
        ));
    }
    Ok(session)
}

/// All-or-nothing batch validation with positional diagnostics: any invalid
/// record fails the entire call before a single entry is appended.
fn validate_batch(
    validator: &dyn SchemaValidator,
    action: Action,
    records: &[RecordSubmission],
    schema: &serde_json::Value,
) -> Result<(), BrokerError> {
    let mut issues = Vec::new();

    for (index, record) in records.iter().enumerate() {
        if record.id.trim().is_empty() {
            issues.push(BatchIssue::new(index, "record id must be non-empty"));
            continue;
        }
        if action == Action::Upsert {
            for problem in validator.validate(&record.entity, schema) {
                issues.push(BatchIssue::new(index, problem));
            }
        }
    }

    if issues.is_empty() {
        Ok(())
    } else {
        Err(BrokerError::bad_batch("record validation failed", issues))
    }
}

fn timeseries_map(registered: &serde_json::Value) -> BTreeMap<String, serde_json::Value> {
    match registered.as_object() {
        Some(map) => map
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
        None => BTreeMap::new(),
    }
}

async fn apply_entry(conn: &mut PgConnection, entry: &OperationEntry) -> Result<(), BrokerError> {
    match entry.action {
        Action::Upsert => {
            let payload = entry.payload.as_ref().ok_or_else(|| {
                BrokerError::internal(format!(
                    "upsert log entry {} has no payload",
                    entry.sequence
                ))
            })?;
            catalog::upsert_record(
                conn,
                &entry.connector_id,
                &entry.public_id,
                &entry.vendor_id,
                payload,
            )
            .await
        }
        Action::Delete => catalog::delete_record(conn, &entry.connector_id, &entry.vendor_id).await,
    }
}
