//! SQLite-backed store with WAL for durable delivery state
//!
//! The connection lives behind a mutex, so a dequeue's select-then-mark is
//! atomic with respect to every other caller of this store instance. WAL
//! mode keeps the queue recoverable across crashes.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::{params, Connection, Row};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::id::Id;
use crate::pattern;
use crate::traits::{CatalogStore, DeliveryStore, DlqStore, EndpointStore, EventStore, Store};
use crate::types::{
    Delivery, DeliveryState, DlqEntry, Endpoint, Event, EventType, ListOptions, ListTypesOptions,
    QueueStats,
};

const REPLAY_DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// SQLite implementation of the aggregate [`Store`] contract.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    closed: AtomicBool,
}

impl SqliteStore {
    /// Open or create a store database. Call [`Store::migrate`] before use.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(db_err)?;

        // WAL for crash recovery; busy timeout covers concurrent opens.
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA wal_autocheckpoint = 1000;
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(db_err)?;

        Ok(Self {
            conn: Mutex::new(conn),
            closed: AtomicBool::new(false),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
            closed: AtomicBool::new(false),
        })
    }

    fn guard(&self) -> Result<MutexGuard<'_, Connection>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::StoreClosed);
        }
        Ok(self.conn.lock().unwrap())
    }
}

fn db_err(e: rusqlite::Error) -> Error {
    Error::Database(e.to_string())
}

fn ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn from_ms(v: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(v).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn json_or_null(s: Option<String>) -> Option<Value> {
    s.and_then(|s| serde_json::from_str(&s).ok())
}

fn row_to_event_type(row: &Row<'_>) -> rusqlite::Result<EventType> {
    let metadata: String = row.get(11)?;
    Ok(EventType {
        id: Id::from_raw(row.get::<_, String>(0)?),
        name: row.get(1)?,
        description: row.get(2)?,
        group: row.get(3)?,
        schema: json_or_null(row.get(4)?),
        schema_version: row.get(5)?,
        version: row.get(6)?,
        example: json_or_null(row.get(7)?),
        is_deprecated: row.get(8)?,
        deprecated_at: row.get::<_, Option<i64>>(9)?.map(from_ms),
        scope_app_id: row.get(10)?,
        metadata: serde_json::from_str(&metadata).unwrap_or_default(),
        created_at: from_ms(row.get(12)?),
        updated_at: from_ms(row.get(13)?),
    })
}

const EVENT_TYPE_COLS: &str = "id, name, description, type_group, schema_json, schema_version, \
     version, example_json, is_deprecated, deprecated_at, scope_app_id, metadata_json, \
     created_at, updated_at";

fn row_to_endpoint(row: &Row<'_>) -> rusqlite::Result<Endpoint> {
    let patterns: String = row.get(5)?;
    let headers: String = row.get(6)?;
    let metadata: String = row.get(9)?;
    Ok(Endpoint {
        id: Id::from_raw(row.get::<_, String>(0)?),
        tenant_id: row.get(1)?,
        url: row.get(2)?,
        description: row.get(3)?,
        secret: row.get(4)?,
        event_types: serde_json::from_str(&patterns).unwrap_or_default(),
        headers: serde_json::from_str(&headers).unwrap_or_default(),
        enabled: row.get(7)?,
        rate_limit: row.get::<_, Option<i64>>(8)?.map(|v| v as u32),
        metadata: serde_json::from_str(&metadata).unwrap_or_default(),
        created_at: from_ms(row.get(10)?),
        updated_at: from_ms(row.get(11)?),
    })
}

const ENDPOINT_COLS: &str = "id, tenant_id, url, description, secret, event_types_json, \
     headers_json, enabled, rate_limit, metadata_json, created_at, updated_at";

fn row_to_event(row: &Row<'_>) -> rusqlite::Result<Event> {
    let data: String = row.get(3)?;
    Ok(Event {
        id: Id::from_raw(row.get::<_, String>(0)?),
        event_type: row.get(1)?,
        tenant_id: row.get(2)?,
        data: serde_json::from_str(&data).unwrap_or(Value::Null),
        idempotency_key: row.get(4)?,
        scope_app_id: row.get(5)?,
        scope_org_id: row.get(6)?,
        created_at: from_ms(row.get(7)?),
        updated_at: from_ms(row.get(8)?),
    })
}

const EVENT_COLS: &str = "id, event_type, tenant_id, data_json, idempotency_key, scope_app_id, \
     scope_org_id, created_at, updated_at";

fn row_to_delivery(row: &Row<'_>) -> rusqlite::Result<Delivery> {
    let state: String = row.get(3)?;
    Ok(Delivery {
        id: Id::from_raw(row.get::<_, String>(0)?),
        event_id: Id::from_raw(row.get::<_, String>(1)?),
        endpoint_id: Id::from_raw(row.get::<_, String>(2)?),
        state: DeliveryState::parse(&state).unwrap_or(DeliveryState::Pending),
        attempt_count: row.get(4)?,
        max_attempts: row.get(5)?,
        next_attempt_at: from_ms(row.get(6)?),
        last_error: row.get(7)?,
        last_status_code: row.get::<_, Option<i64>>(8)?.map(|v| v as u16),
        last_response: row.get(9)?,
        last_latency_ms: row.get::<_, Option<i64>>(10)?.map(|v| v as u64),
        completed_at: row.get::<_, Option<i64>>(11)?.map(from_ms),
        created_at: from_ms(row.get(12)?),
        updated_at: from_ms(row.get(13)?),
    })
}

const DELIVERY_COLS: &str = "id, event_id, endpoint_id, state, attempt_count, max_attempts, \
     next_attempt_at, last_error, last_status_code, last_response, last_latency_ms, \
     completed_at, created_at, updated_at";

fn row_to_dlq(row: &Row<'_>) -> rusqlite::Result<DlqEntry> {
    let payload: String = row.get(7)?;
    Ok(DlqEntry {
        id: Id::from_raw(row.get::<_, String>(0)?),
        delivery_id: Id::from_raw(row.get::<_, String>(1)?),
        event_id: Id::from_raw(row.get::<_, String>(2)?),
        endpoint_id: Id::from_raw(row.get::<_, String>(3)?),
        tenant_id: row.get(4)?,
        event_type: row.get(5)?,
        url: row.get(6)?,
        payload: serde_json::from_str(&payload).unwrap_or(Value::Null),
        error: row.get(8)?,
        attempt_count: row.get(9)?,
        last_status_code: row.get::<_, Option<i64>>(10)?.map(|v| v as u16),
        replayed_at: row.get::<_, Option<i64>>(11)?.map(from_ms),
        failed_at: from_ms(row.get(12)?),
        created_at: from_ms(row.get(13)?),
        updated_at: from_ms(row.get(14)?),
    })
}

const DLQ_COLS: &str = "id, delivery_id, event_id, endpoint_id, tenant_id, event_type, url, \
     payload_json, error, attempt_count, last_status_code, replayed_at, failed_at, \
     created_at, updated_at";

fn page_clause(opts: &ListOptions) -> String {
    format!(
        " LIMIT {} OFFSET {}",
        opts.limit.map(|l| l as i64).unwrap_or(-1),
        opts.offset
    )
}

impl CatalogStore for SqliteStore {
    fn register_type(&self, def: EventType) -> Result<EventType> {
        let conn = self.guard()?;
        let now = Utc::now();

        let existing = conn
            .query_row(
                &format!("SELECT {EVENT_TYPE_COLS} FROM event_types WHERE name = ?1"),
                params![def.name],
                row_to_event_type,
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(db_err(other)),
            })?;

        let merged = match existing {
            Some(prior) => {
                let mut updated = def;
                updated.id = prior.id;
                updated.created_at = prior.created_at;
                updated.version = prior.version + 1;
                updated.is_deprecated = false;
                updated.deprecated_at = None;
                updated.updated_at = now;
                updated
            }
            None => def,
        };

        conn.execute(
            "INSERT OR REPLACE INTO event_types \
             (id, name, description, type_group, schema_json, schema_version, version, \
              example_json, is_deprecated, deprecated_at, scope_app_id, metadata_json, \
              created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                merged.id.as_str(),
                merged.name,
                merged.description,
                merged.group,
                merged.schema.as_ref().map(|v| v.to_string()),
                merged.schema_version,
                merged.version,
                merged.example.as_ref().map(|v| v.to_string()),
                merged.is_deprecated,
                merged.deprecated_at.map(ms),
                merged.scope_app_id,
                serde_json::to_string(&merged.metadata).unwrap_or_else(|_| "{}".to_string()),
                ms(merged.created_at),
                ms(merged.updated_at),
            ],
        )
        .map_err(db_err)?;

        Ok(merged)
    }

    fn get_type(&self, name: &str) -> Result<EventType> {
        let conn = self.guard()?;
        conn.query_row(
            &format!("SELECT {EVENT_TYPE_COLS} FROM event_types WHERE name = ?1"),
            params![name],
            row_to_event_type,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Error::EventTypeNotFound(name.to_string()),
            other => db_err(other),
        })
    }

    fn get_type_by_id(&self, id: &Id) -> Result<EventType> {
        let conn = self.guard()?;
        conn.query_row(
            &format!("SELECT {EVENT_TYPE_COLS} FROM event_types WHERE id = ?1"),
            params![id.as_str()],
            row_to_event_type,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Error::EventTypeNotFound(id.to_string()),
            other => db_err(other),
        })
    }

    fn list_types(&self, opts: &ListTypesOptions) -> Result<Vec<EventType>> {
        let conn = self.guard()?;
        let mut sql = format!("SELECT {EVENT_TYPE_COLS} FROM event_types WHERE 1=1");
        if !opts.include_deprecated {
            sql.push_str(" AND is_deprecated = 0");
        }
        if opts.group.is_some() {
            sql.push_str(" AND type_group = ?1");
        }
        sql.push_str(" ORDER BY name ASC");
        sql.push_str(&page_clause(&opts.page));

        let mut stmt = conn.prepare(&sql).map_err(db_err)?;
        let rows = match &opts.group {
            Some(group) => stmt.query_map(params![group], row_to_event_type),
            None => stmt.query_map([], row_to_event_type),
        }
        .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    fn delete_type(&self, name: &str) -> Result<EventType> {
        {
            let conn = self.guard()?;
            let now = ms(Utc::now());
            let changed = conn
                .execute(
                    "UPDATE event_types SET is_deprecated = 1, deprecated_at = ?1, updated_at = ?1 \
                     WHERE name = ?2",
                    params![now, name],
                )
                .map_err(db_err)?;
            if changed == 0 {
                return Err(Error::EventTypeNotFound(name.to_string()));
            }
        }
        self.get_type(name)
    }

    fn match_types(&self, pattern_str: &str) -> Result<Vec<EventType>> {
        let conn = self.guard()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {EVENT_TYPE_COLS} FROM event_types WHERE is_deprecated = 0 ORDER BY name"
            ))
            .map_err(db_err)?;
        let rows = stmt.query_map([], row_to_event_type).map_err(db_err)?;
        let types = rows
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;
        Ok(types
            .into_iter()
            .filter(|t| pattern::matches(pattern_str, &t.name))
            .collect())
    }
}

impl EndpointStore for SqliteStore {
    fn create_endpoint(&self, endpoint: Endpoint) -> Result<Endpoint> {
        let conn = self.guard()?;
        conn.execute(
            "INSERT INTO endpoints \
             (id, tenant_id, url, description, secret, event_types_json, headers_json, enabled, \
              rate_limit, metadata_json, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                endpoint.id.as_str(),
                endpoint.tenant_id,
                endpoint.url,
                endpoint.description,
                endpoint.secret,
                serde_json::to_string(&endpoint.event_types).unwrap_or_else(|_| "[]".to_string()),
                serde_json::to_string(&endpoint.headers).unwrap_or_else(|_| "{}".to_string()),
                endpoint.enabled,
                endpoint.rate_limit.map(|v| v as i64),
                serde_json::to_string(&endpoint.metadata).unwrap_or_else(|_| "{}".to_string()),
                ms(endpoint.created_at),
                ms(endpoint.updated_at),
            ],
        )
        .map_err(db_err)?;
        Ok(endpoint)
    }

    fn get_endpoint(&self, id: &Id) -> Result<Endpoint> {
        let conn = self.guard()?;
        conn.query_row(
            &format!("SELECT {ENDPOINT_COLS} FROM endpoints WHERE id = ?1"),
            params![id.as_str()],
            row_to_endpoint,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Error::EndpointNotFound(id.to_string()),
            other => db_err(other),
        })
    }

    fn update_endpoint(&self, endpoint: Endpoint) -> Result<Endpoint> {
        let conn = self.guard()?;
        let changed = conn
            .execute(
                "UPDATE endpoints SET tenant_id = ?2, url = ?3, description = ?4, secret = ?5, \
                 event_types_json = ?6, headers_json = ?7, enabled = ?8, rate_limit = ?9, \
                 metadata_json = ?10, updated_at = ?11 WHERE id = ?1",
                params![
                    endpoint.id.as_str(),
                    endpoint.tenant_id,
                    endpoint.url,
                    endpoint.description,
                    endpoint.secret,
                    serde_json::to_string(&endpoint.event_types)
                        .unwrap_or_else(|_| "[]".to_string()),
                    serde_json::to_string(&endpoint.headers).unwrap_or_else(|_| "{}".to_string()),
                    endpoint.enabled,
                    endpoint.rate_limit.map(|v| v as i64),
                    serde_json::to_string(&endpoint.metadata).unwrap_or_else(|_| "{}".to_string()),
                    ms(Utc::now()),
                ],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(Error::EndpointNotFound(endpoint.id.to_string()));
        }
        Ok(endpoint)
    }

    fn delete_endpoint(&self, id: &Id) -> Result<()> {
        let conn = self.guard()?;
        let changed = conn
            .execute("DELETE FROM endpoints WHERE id = ?1", params![id.as_str()])
            .map_err(db_err)?;
        if changed == 0 {
            return Err(Error::EndpointNotFound(id.to_string()));
        }
        Ok(())
    }

    fn list_endpoints(&self, tenant_id: &str, opts: &ListOptions) -> Result<Vec<Endpoint>> {
        let conn = self.guard()?;
        let sql = format!(
            "SELECT {ENDPOINT_COLS} FROM endpoints WHERE tenant_id = ?1 ORDER BY id{}",
            page_clause(opts)
        );
        let mut stmt = conn.prepare(&sql).map_err(db_err)?;
        let rows = stmt
            .query_map(params![tenant_id], row_to_endpoint)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    fn resolve(&self, tenant_id: &str, event_type: &str) -> Result<Vec<Endpoint>> {
        let conn = self.guard()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {ENDPOINT_COLS} FROM endpoints \
                 WHERE tenant_id = ?1 AND enabled = 1 ORDER BY id"
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![tenant_id], row_to_endpoint)
            .map_err(db_err)?;
        let endpoints = rows
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;
        Ok(endpoints
            .into_iter()
            .filter(|e| pattern::any_matches(&e.event_types, event_type))
            .collect())
    }

    fn set_endpoint_enabled(&self, id: &Id, enabled: bool) -> Result<()> {
        let conn = self.guard()?;
        let changed = conn
            .execute(
                "UPDATE endpoints SET enabled = ?2, updated_at = ?3 WHERE id = ?1",
                params![id.as_str(), enabled, ms(Utc::now())],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(Error::EndpointNotFound(id.to_string()));
        }
        Ok(())
    }
}

impl EventStore for SqliteStore {
    fn create_event(&self, event: Event) -> Result<Event> {
        let conn = self.guard()?;
        let key = event
            .idempotency_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .map(|k| k.to_string());
        conn.execute(
            "INSERT INTO events \
             (id, event_type, tenant_id, data_json, idempotency_key, scope_app_id, scope_org_id, \
              created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                event.id.as_str(),
                event.event_type,
                event.tenant_id,
                event.data.to_string(),
                key,
                event.scope_app_id,
                event.scope_org_id,
                ms(event.created_at),
                ms(event.updated_at),
            ],
        )
        .map_err(|e| match &e {
            rusqlite::Error::SqliteFailure(inner, _)
                if inner.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Error::DuplicateIdempotencyKey(
                    event.idempotency_key.clone().unwrap_or_default(),
                )
            }
            _ => db_err(e),
        })?;
        Ok(event)
    }

    fn get_event(&self, id: &Id) -> Result<Event> {
        let conn = self.guard()?;
        conn.query_row(
            &format!("SELECT {EVENT_COLS} FROM events WHERE id = ?1"),
            params![id.as_str()],
            row_to_event,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Error::EventNotFound(id.to_string()),
            other => db_err(other),
        })
    }

    fn list_events(&self, opts: &ListOptions) -> Result<Vec<Event>> {
        let conn = self.guard()?;
        let sql = format!(
            "SELECT {EVENT_COLS} FROM events ORDER BY id DESC{}",
            page_clause(opts)
        );
        let mut stmt = conn.prepare(&sql).map_err(db_err)?;
        let rows = stmt.query_map([], row_to_event).map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    fn list_events_by_tenant(&self, tenant_id: &str, opts: &ListOptions) -> Result<Vec<Event>> {
        let conn = self.guard()?;
        let sql = format!(
            "SELECT {EVENT_COLS} FROM events WHERE tenant_id = ?1 ORDER BY id DESC{}",
            page_clause(opts)
        );
        let mut stmt = conn.prepare(&sql).map_err(db_err)?;
        let rows = stmt
            .query_map(params![tenant_id], row_to_event)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }
}

fn insert_delivery(conn: &Connection, delivery: &Delivery) -> Result<()> {
    conn.execute(
        "INSERT INTO deliveries \
         (id, event_id, endpoint_id, state, attempt_count, max_attempts, next_attempt_at, \
          last_error, last_status_code, last_response, last_latency_ms, completed_at, \
          created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            delivery.id.as_str(),
            delivery.event_id.as_str(),
            delivery.endpoint_id.as_str(),
            delivery.state.as_str(),
            delivery.attempt_count,
            delivery.max_attempts,
            ms(delivery.next_attempt_at),
            delivery.last_error,
            delivery.last_status_code.map(|v| v as i64),
            delivery.last_response,
            delivery.last_latency_ms.map(|v| v as i64),
            delivery.completed_at.map(ms),
            ms(delivery.created_at),
            ms(delivery.updated_at),
        ],
    )
    .map_err(db_err)?;
    Ok(())
}

impl DeliveryStore for SqliteStore {
    fn enqueue(&self, delivery: Delivery) -> Result<Delivery> {
        let conn = self.guard()?;
        insert_delivery(&conn, &delivery)?;
        Ok(delivery)
    }

    fn enqueue_batch(&self, deliveries: Vec<Delivery>) -> Result<Vec<Delivery>> {
        let conn = self.guard()?;
        conn.execute_batch("BEGIN").map_err(db_err)?;
        for delivery in &deliveries {
            if let Err(e) = insert_delivery(&conn, delivery) {
                let _ = conn.execute_batch("ROLLBACK");
                return Err(e);
            }
        }
        conn.execute_batch("COMMIT").map_err(db_err)?;
        Ok(deliveries)
    }

    fn dequeue(&self, limit: usize) -> Result<Vec<Delivery>> {
        let conn = self.guard()?;
        let now = ms(Utc::now());

        let ids: Vec<String> = {
            let mut stmt = conn
                .prepare(
                    "SELECT id FROM deliveries \
                     WHERE state = 'pending' AND next_attempt_at <= ?1 \
                     ORDER BY next_attempt_at ASC LIMIT ?2",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![now, limit as i64], |row| row.get(0))
                .map_err(db_err)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)?
        };

        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            // The state filter keeps the transition one-shot even if the row
            // changed between select and update.
            let changed = conn
                .execute(
                    "UPDATE deliveries \
                     SET state = 'delivering', claimed_at = ?2, updated_at = ?2 \
                     WHERE id = ?1 AND state = 'pending'",
                    params![id, now],
                )
                .map_err(db_err)?;
            if changed == 0 {
                continue;
            }
            let delivery = conn
                .query_row(
                    &format!("SELECT {DELIVERY_COLS} FROM deliveries WHERE id = ?1"),
                    params![id],
                    row_to_delivery,
                )
                .map_err(db_err)?;
            claimed.push(delivery);
        }
        Ok(claimed)
    }

    fn update_delivery(&self, mut delivery: Delivery) -> Result<Delivery> {
        let conn = self.guard()?;
        delivery.updated_at = Utc::now();
        let claimed_at: Option<i64> = if delivery.state == DeliveryState::Delivering {
            Some(ms(delivery.updated_at))
        } else {
            None
        };
        let changed = conn
            .execute(
                "UPDATE deliveries SET state = ?2, attempt_count = ?3, max_attempts = ?4, \
                 next_attempt_at = ?5, last_error = ?6, last_status_code = ?7, \
                 last_response = ?8, last_latency_ms = ?9, completed_at = ?10, \
                 claimed_at = ?11, updated_at = ?12 WHERE id = ?1",
                params![
                    delivery.id.as_str(),
                    delivery.state.as_str(),
                    delivery.attempt_count,
                    delivery.max_attempts,
                    ms(delivery.next_attempt_at),
                    delivery.last_error,
                    delivery.last_status_code.map(|v| v as i64),
                    delivery.last_response,
                    delivery.last_latency_ms.map(|v| v as i64),
                    delivery.completed_at.map(ms),
                    claimed_at,
                    ms(delivery.updated_at),
                ],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(Error::DeliveryNotFound(delivery.id.to_string()));
        }
        Ok(delivery)
    }

    fn get_delivery(&self, id: &Id) -> Result<Delivery> {
        let conn = self.guard()?;
        conn.query_row(
            &format!("SELECT {DELIVERY_COLS} FROM deliveries WHERE id = ?1"),
            params![id.as_str()],
            row_to_delivery,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Error::DeliveryNotFound(id.to_string()),
            other => db_err(other),
        })
    }

    fn list_by_endpoint(&self, endpoint_id: &Id, opts: &ListOptions) -> Result<Vec<Delivery>> {
        let conn = self.guard()?;
        let sql = format!(
            "SELECT {DELIVERY_COLS} FROM deliveries WHERE endpoint_id = ?1 ORDER BY id DESC{}",
            page_clause(opts)
        );
        let mut stmt = conn.prepare(&sql).map_err(db_err)?;
        let rows = stmt
            .query_map(params![endpoint_id.as_str()], row_to_delivery)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    fn list_by_event(&self, event_id: &Id) -> Result<Vec<Delivery>> {
        let conn = self.guard()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {DELIVERY_COLS} FROM deliveries WHERE event_id = ?1 ORDER BY id ASC"
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![event_id.as_str()], row_to_delivery)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    fn count_pending(&self) -> Result<usize> {
        let conn = self.guard()?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM deliveries WHERE state = 'pending'",
                [],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        Ok(count as usize)
    }

    fn recover_stale(&self, older_than: ChronoDuration) -> Result<usize> {
        let conn = self.guard()?;
        let now = Utc::now();
        let cutoff = ms(now - older_than);
        let recovered = conn
            .execute(
                "UPDATE deliveries \
                 SET state = 'pending', next_attempt_at = ?1, claimed_at = NULL, \
                     last_error = 'recovered stale claim: previous attempt outcome unknown', \
                     updated_at = ?1 \
                 WHERE state = 'delivering' AND claimed_at IS NOT NULL AND claimed_at < ?2",
                params![ms(now), cutoff],
            )
            .map_err(db_err)?;
        if recovered > 0 {
            tracing::warn!(recovered, "recovered stale in-flight deliveries");
        }
        Ok(recovered)
    }

    fn stats(&self) -> Result<QueueStats> {
        let conn = self.guard()?;
        let mut stats: QueueStats = conn
            .query_row(
                "SELECT \
                    SUM(CASE WHEN state = 'pending' THEN 1 ELSE 0 END), \
                    SUM(CASE WHEN state = 'delivering' THEN 1 ELSE 0 END), \
                    SUM(CASE WHEN state = 'delivered' THEN 1 ELSE 0 END), \
                    SUM(CASE WHEN state = 'failed' THEN 1 ELSE 0 END) \
                 FROM deliveries",
                [],
                |row| {
                    Ok(QueueStats {
                        pending: row.get::<_, Option<i64>>(0)?.unwrap_or(0) as usize,
                        delivering: row.get::<_, Option<i64>>(1)?.unwrap_or(0) as usize,
                        delivered: row.get::<_, Option<i64>>(2)?.unwrap_or(0) as usize,
                        failed: row.get::<_, Option<i64>>(3)?.unwrap_or(0) as usize,
                        dlq: 0,
                    })
                },
            )
            .map_err(db_err)?;
        let dlq: i64 = conn
            .query_row("SELECT COUNT(*) FROM dlq_entries", [], |row| row.get(0))
            .map_err(db_err)?;
        stats.dlq = dlq as usize;
        Ok(stats)
    }
}

impl DlqStore for SqliteStore {
    fn push_dlq(&self, entry: DlqEntry) -> Result<DlqEntry> {
        let conn = self.guard()?;
        conn.execute(
            "INSERT INTO dlq_entries \
             (id, delivery_id, event_id, endpoint_id, tenant_id, event_type, url, payload_json, \
              error, attempt_count, last_status_code, replayed_at, failed_at, created_at, \
              updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                entry.id.as_str(),
                entry.delivery_id.as_str(),
                entry.event_id.as_str(),
                entry.endpoint_id.as_str(),
                entry.tenant_id,
                entry.event_type,
                entry.url,
                entry.payload.to_string(),
                entry.error,
                entry.attempt_count,
                entry.last_status_code.map(|v| v as i64),
                entry.replayed_at.map(ms),
                ms(entry.failed_at),
                ms(entry.created_at),
                ms(entry.updated_at),
            ],
        )
        .map_err(db_err)?;
        Ok(entry)
    }

    fn list_dlq(&self, opts: &ListOptions) -> Result<Vec<DlqEntry>> {
        let conn = self.guard()?;
        let sql = format!(
            "SELECT {DLQ_COLS} FROM dlq_entries ORDER BY id DESC{}",
            page_clause(opts)
        );
        let mut stmt = conn.prepare(&sql).map_err(db_err)?;
        let rows = stmt.query_map([], row_to_dlq).map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    fn get_dlq(&self, id: &Id) -> Result<DlqEntry> {
        let conn = self.guard()?;
        conn.query_row(
            &format!("SELECT {DLQ_COLS} FROM dlq_entries WHERE id = ?1"),
            params![id.as_str()],
            row_to_dlq,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Error::DlqNotFound(id.to_string()),
            other => db_err(other),
        })
    }

    fn replay_dlq(&self, id: &Id) -> Result<Delivery> {
        let entry = self.get_dlq(id)?;

        let conn = self.guard()?;
        let max_attempts: u32 = conn
            .query_row(
                "SELECT max_attempts FROM deliveries WHERE id = ?1",
                params![entry.delivery_id.as_str()],
                |row| row.get(0),
            )
            .unwrap_or(REPLAY_DEFAULT_MAX_ATTEMPTS);

        let replacement =
            Delivery::new_pending(entry.event_id.clone(), entry.endpoint_id.clone(), max_attempts);
        insert_delivery(&conn, &replacement)?;

        conn.execute(
            "UPDATE dlq_entries SET replayed_at = ?2, updated_at = ?2 WHERE id = ?1",
            params![id.as_str(), ms(Utc::now())],
        )
        .map_err(db_err)?;
        Ok(replacement)
    }

    fn replay_dlq_bulk(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<usize> {
        let candidates: Vec<Id> = {
            let conn = self.guard()?;
            let mut stmt = conn
                .prepare(
                    "SELECT id FROM dlq_entries \
                     WHERE replayed_at IS NULL AND failed_at >= ?1 AND failed_at <= ?2",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![ms(from), ms(to)], |row| {
                    row.get::<_, String>(0).map(Id::from_raw)
                })
                .map_err(db_err)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)?
        };

        let mut replayed = 0;
        for id in candidates {
            match self.replay_dlq(&id) {
                Ok(_) => replayed += 1,
                Err(e) => tracing::warn!(entry = %id, error = %e, "bulk replay skipped entry"),
            }
        }
        Ok(replayed)
    }

    fn purge_dlq(&self, before: DateTime<Utc>) -> Result<usize> {
        let conn = self.guard()?;
        let purged = conn
            .execute(
                "DELETE FROM dlq_entries WHERE failed_at < ?1",
                params![ms(before)],
            )
            .map_err(db_err)?;
        Ok(purged)
    }

    fn count_dlq(&self) -> Result<usize> {
        let conn = self.guard()?;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM dlq_entries", [], |row| row.get(0))
            .map_err(db_err)?;
        Ok(count as usize)
    }
}

impl Store for SqliteStore {
    fn migrate(&self) -> Result<()> {
        let conn = self.guard()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS event_types (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                description TEXT NOT NULL DEFAULT '',
                type_group TEXT NOT NULL DEFAULT '',
                schema_json TEXT,
                schema_version INTEGER NOT NULL DEFAULT 0,
                version INTEGER NOT NULL DEFAULT 1,
                example_json TEXT,
                is_deprecated INTEGER NOT NULL DEFAULT 0,
                deprecated_at INTEGER,
                scope_app_id TEXT,
                metadata_json TEXT NOT NULL DEFAULT '{}',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS endpoints (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                url TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                secret TEXT NOT NULL,
                event_types_json TEXT NOT NULL,
                headers_json TEXT NOT NULL DEFAULT '{}',
                enabled INTEGER NOT NULL DEFAULT 1,
                rate_limit INTEGER,
                metadata_json TEXT NOT NULL DEFAULT '{}',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_endpoints_tenant
                ON endpoints (tenant_id);

            CREATE TABLE IF NOT EXISTS events (
                id TEXT PRIMARY KEY,
                event_type TEXT NOT NULL,
                tenant_id TEXT NOT NULL,
                data_json TEXT NOT NULL,
                idempotency_key TEXT,
                scope_app_id TEXT,
                scope_org_id TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_events_idempotency
                ON events (idempotency_key)
                WHERE idempotency_key IS NOT NULL AND idempotency_key != '';

            CREATE INDEX IF NOT EXISTS idx_events_tenant
                ON events (tenant_id);

            CREATE TABLE IF NOT EXISTS deliveries (
                id TEXT PRIMARY KEY,
                event_id TEXT NOT NULL,
                endpoint_id TEXT NOT NULL,
                state TEXT NOT NULL DEFAULT 'pending',
                attempt_count INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL,
                next_attempt_at INTEGER NOT NULL,
                last_error TEXT,
                last_status_code INTEGER,
                last_response TEXT,
                last_latency_ms INTEGER,
                completed_at INTEGER,
                claimed_at INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_deliveries_claimable
                ON deliveries (state, next_attempt_at);

            CREATE INDEX IF NOT EXISTS idx_deliveries_endpoint
                ON deliveries (endpoint_id);

            CREATE INDEX IF NOT EXISTS idx_deliveries_event
                ON deliveries (event_id);

            CREATE TABLE IF NOT EXISTS dlq_entries (
                id TEXT PRIMARY KEY,
                delivery_id TEXT NOT NULL,
                event_id TEXT NOT NULL,
                endpoint_id TEXT NOT NULL,
                tenant_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                url TEXT NOT NULL,
                payload_json TEXT NOT NULL,
                error TEXT NOT NULL,
                attempt_count INTEGER NOT NULL,
                last_status_code INTEGER,
                replayed_at INTEGER,
                failed_at INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_dlq_failed
                ON dlq_entries (failed_at);",
        )
        .map_err(|e| Error::Migration(e.to_string()))
    }

    fn ping(&self) -> Result<()> {
        let conn = self.guard()?;
        conn.query_row("SELECT 1", [], |_| Ok(()))
            .map_err(db_err)
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
