use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use serde_json::Value;
use thiserror::Error;

use crate::domain::models::Document;

pub const LATEST_SCHEMA_VERSION: u32 = 2;

const MIGRATIONS: &[(u32, &str)] = &[
    (
        1,
        r#"
CREATE TABLE IF NOT EXISTS documents (
    tenant_id TEXT NOT NULL,
    collection TEXT NOT NULL,
    id TEXT NOT NULL,
    body TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (tenant_id, collection, id)
);

CREATE INDEX IF NOT EXISTS idx_documents_tenant_collection
ON documents (tenant_id, collection, id);
"#,
    ),
    (
        2,
        r#"
CREATE TABLE IF NOT EXISTS locks (
    tenant_id TEXT NOT NULL,
    name TEXT NOT NULL,
    holder TEXT NOT NULL,
    acquired_at_ms INTEGER NOT NULL,
    expires_at_ms INTEGER NOT NULL,
    PRIMARY KEY (tenant_id, name)
);
"#,
    ),
];

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database operation failed: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("document serialization failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported schema version {current}; latest supported is {latest}")]
    UnsupportedSchemaVersion { current: u32, latest: u32 },
}

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub fn open_connection(path: &str) -> Result<Connection, DbError> {
    let connection = Connection::open(path)?;
    connection.busy_timeout(BUSY_TIMEOUT)?;
    Ok(connection)
}

pub fn run_migrations(connection: &mut Connection) -> Result<(), DbError> {
    let current_version = schema_version(connection)?;

    if current_version > LATEST_SCHEMA_VERSION {
        return Err(DbError::UnsupportedSchemaVersion {
            current: current_version,
            latest: LATEST_SCHEMA_VERSION,
        });
    }

    let transaction = connection.transaction()?;

    for (version, sql) in MIGRATIONS {
        if *version > current_version {
            transaction.execute_batch(sql)?;
            transaction.pragma_update(None, "user_version", version)?;
        }
    }

    transaction.commit()?;

    Ok(())
}

pub fn schema_version(connection: &Connection) -> Result<u32, DbError> {
    let version = connection.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(version)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Paging {
    pub limit: u32,
    pub skip: u32,
}

impl Paging {
    pub fn first(limit: u32) -> Self {
        Self { limit, skip: 0 }
    }

    pub fn next(self) -> Self {
        Self {
            limit: self.limit,
            skip: self.skip + self.limit,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub count: i64,
    pub result: Vec<T>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Eq(&'static str, Value),
    In(&'static str, Vec<Value>),
    After(&'static str, DateTime<Utc>),
    IsNull(&'static str),
    NotNull(&'static str),
}

// Every `all` condition holds, plus one `any` condition when there are some.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    all: Vec<Condition>,
    any: Vec<Condition>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, path: &'static str, value: impl Into<Value>) -> Self {
        self.all.push(Condition::Eq(path, value.into()));
        self
    }

    pub fn is_null(mut self, path: &'static str) -> Self {
        self.all.push(Condition::IsNull(path));
        self
    }

    pub fn not_null(mut self, path: &'static str) -> Self {
        self.all.push(Condition::NotNull(path));
        self
    }

    pub fn after(mut self, path: &'static str, since: DateTime<Utc>) -> Self {
        self.all.push(Condition::After(path, since));
        self
    }

    pub fn any_of(mut self, conditions: Vec<Condition>) -> Self {
        self.any.extend(conditions);
        self
    }

    fn to_sql(&self, params: &mut Vec<SqlValue>) -> String {
        let mut clauses: Vec<String> = self
            .all
            .iter()
            .map(|condition| condition_sql(condition, params))
            .collect();

        if !self.any.is_empty() {
            let alternatives: Vec<String> = self
                .any
                .iter()
                .map(|condition| condition_sql(condition, params))
                .collect();
            clauses.push(format!("({})", alternatives.join(" OR ")));
        }

        clauses
            .into_iter()
            .map(|clause| format!(" AND {clause}"))
            .collect()
    }
}

fn condition_sql(condition: &Condition, params: &mut Vec<SqlValue>) -> String {
    match condition {
        Condition::Eq(path, Value::Null) | Condition::IsNull(path) => {
            params.push(SqlValue::Text((*path).to_string()));
            "json_extract(body, ?) IS NULL".to_string()
        }
        Condition::NotNull(path) => {
            params.push(SqlValue::Text((*path).to_string()));
            "json_extract(body, ?) IS NOT NULL".to_string()
        }
        Condition::Eq(path, value) => {
            params.push(SqlValue::Text((*path).to_string()));
            params.push(json_to_sql(value));
            "json_extract(body, ?) = ?".to_string()
        }
        Condition::In(_, values) if values.is_empty() => "0".to_string(),
        Condition::In(path, values) => {
            params.push(SqlValue::Text((*path).to_string()));
            let placeholders = vec!["?"; values.len()].join(", ");
            params.extend(values.iter().map(json_to_sql));
            format!("json_extract(body, ?) IN ({placeholders})")
        }
        Condition::After(path, since) => {
            params.push(SqlValue::Text((*path).to_string()));
            params.push(SqlValue::Text(since.to_rfc3339_opts(
                SecondsFormat::Millis,
                true,
            )));
            "julianday(json_extract(body, ?)) > julianday(?)".to_string()
        }
    }
}

fn json_to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(flag) => SqlValue::Integer(i64::from(*flag)),
        Value::Number(number) => number
            .as_i64()
            .map(SqlValue::Integer)
            .or_else(|| number.as_f64().map(SqlValue::Real))
            .unwrap_or(SqlValue::Null),
        Value::String(text) => SqlValue::Text(text.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

pub fn find_documents<T: Document>(
    connection: &Connection,
    tenant_id: &str,
    filter: &Filter,
    paging: Paging,
) -> Result<Page<T>, DbError> {
    let mut params = vec![
        SqlValue::Text(tenant_id.to_string()),
        SqlValue::Text(T::COLLECTION.to_string()),
    ];
    let where_clause = format!(
        "WHERE tenant_id = ? AND collection = ?{}",
        filter.to_sql(&mut params)
    );

    let count: i64 = connection.query_row(
        &format!("SELECT COUNT(*) FROM documents {where_clause}"),
        params_from_iter(params.iter()),
        |row| row.get(0),
    )?;

    params.push(SqlValue::Integer(i64::from(paging.limit)));
    params.push(SqlValue::Integer(i64::from(paging.skip)));
    let mut statement = connection.prepare(&format!(
        "SELECT body FROM documents {where_clause} ORDER BY id LIMIT ? OFFSET ?"
    ))?;
    let rows = statement.query_map(params_from_iter(params.iter()), |row| {
        row.get::<_, String>(0)
    })?;

    let mut result = Vec::new();
    for row in rows {
        result.push(serde_json::from_str(&row?)?);
    }

    Ok(Page { count, result })
}

pub fn find_one<T: Document>(
    connection: &Connection,
    tenant_id: &str,
    filter: &Filter,
) -> Result<Option<T>, DbError> {
    let page = find_documents(connection, tenant_id, filter, Paging::first(1))?;
    Ok(page.result.into_iter().next())
}

pub fn get_document<T: Document>(
    connection: &Connection,
    tenant_id: &str,
    id: &str,
) -> Result<Option<T>, DbError> {
    let body: Option<String> = connection
        .query_row(
            "SELECT body FROM documents WHERE tenant_id = ?1 AND collection = ?2 AND id = ?3",
            params![tenant_id, T::COLLECTION, id],
            |row| row.get(0),
        )
        .optional()?;

    body.map(|body| serde_json::from_str(&body).map_err(DbError::from))
        .transpose()
}

pub fn upsert_document<T: Document>(
    connection: &Connection,
    tenant_id: &str,
    document: &T,
    updated_at: DateTime<Utc>,
) -> Result<String, DbError> {
    let body = serde_json::to_string(document)?;
    connection.execute(
        "INSERT INTO documents (tenant_id, collection, id, body, updated_at) VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT (tenant_id, collection, id) DO UPDATE SET body = excluded.body, updated_at = excluded.updated_at",
        params![
            tenant_id,
            T::COLLECTION,
            document.id(),
            body,
            updated_at.to_rfc3339_opts(SecondsFormat::Millis, true),
        ],
    )?;

    Ok(document.id().to_string())
}

pub fn list_tenants(connection: &Connection, collection: &str) -> Result<Vec<String>, DbError> {
    let mut statement = connection
        .prepare("SELECT DISTINCT tenant_id FROM documents WHERE collection = ?1 ORDER BY tenant_id")?;
    let rows = statement.query_map(params![collection], |row| row.get::<_, String>(0))?;

    let mut tenants = Vec::new();
    for row in rows {
        tenants.push(row?);
    }

    Ok(tenants)
}

// Expired entries are reclaimed.
pub fn try_acquire_lock(
    connection: &Connection,
    tenant_id: &str,
    name: &str,
    holder: &str,
    now: DateTime<Utc>,
    ttl_secs: u64,
) -> Result<bool, DbError> {
    let now_ms = now.timestamp_millis();
    let expires_at_ms = now_ms.saturating_add((ttl_secs as i64).saturating_mul(1000));

    connection.execute(
        "DELETE FROM locks WHERE tenant_id = ?1 AND name = ?2 AND expires_at_ms <= ?3",
        params![tenant_id, name, now_ms],
    )?;
    let inserted = connection.execute(
        "INSERT OR IGNORE INTO locks (tenant_id, name, holder, acquired_at_ms, expires_at_ms) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![tenant_id, name, holder, now_ms, expires_at_ms],
    )?;

    Ok(inserted == 1)
}

pub fn release_lock(
    connection: &Connection,
    tenant_id: &str,
    name: &str,
    holder: &str,
) -> Result<bool, DbError> {
    let deleted = connection.execute(
        "DELETE FROM locks WHERE tenant_id = ?1 AND name = ?2 AND holder = ?3",
        params![tenant_id, name, holder],
    )?;

    Ok(deleted == 1)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use chrono::{Duration, TimeZone, Utc};
    use serde_json::json;

    use super::{
        Condition, Filter, LATEST_SCHEMA_VERSION, Paging, find_documents, get_document,
        list_tenants, open_connection, release_lock, run_migrations, schema_version,
        try_acquire_lock, upsert_document,
    };
    use crate::domain::models::Tag;

    fn temp_db_path(name: &str) -> PathBuf {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let path = dir.path().join(name);
        std::mem::forget(dir);
        path
    }

    fn migrated(name: &str) -> rusqlite::Connection {
        let db_path = temp_db_path(name);
        let mut connection =
            open_connection(db_path.to_string_lossy().as_ref()).expect("db connection should open");
        run_migrations(&mut connection).expect("migrations should succeed");
        connection
    }

    fn tag(id: &str, issuer: bool, changed_minute: u32) -> Tag {
        Tag {
            id: id.to_string(),
            issuer,
            active: true,
            user_id: Some(format!("user-{id}")),
            description: String::new(),
            visual_id: None,
            ocpi_token: None,
            last_changed_on: Utc
                .with_ymd_and_hms(2026, 3, 1, 10, changed_minute, 0)
                .unwrap(),
        }
    }

    #[test]
    fn migrates_fresh_database_to_latest_version() {
        let connection = migrated("fresh.sqlite");

        let version = schema_version(&connection).expect("schema version should be queryable");
        assert_eq!(version, LATEST_SCHEMA_VERSION);

        let tables: i64 = connection
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN ('documents', 'locks')",
                [],
                |row| row.get(0),
            )
            .expect("table check should work");
        assert_eq!(tables, 2);
    }

    #[test]
    fn migrations_are_idempotent() {
        let db_path = temp_db_path("idempotent.sqlite");
        let mut connection =
            open_connection(db_path.to_string_lossy().as_ref()).expect("db connection should open");

        run_migrations(&mut connection).expect("first migration run should succeed");
        run_migrations(&mut connection).expect("second migration run should succeed");

        let version = schema_version(&connection).expect("schema version should be queryable");
        assert_eq!(version, LATEST_SCHEMA_VERSION);
    }

    #[test]
    fn upsert_replaces_document_with_same_id() {
        let connection = migrated("upsert.sqlite");
        let now = Utc::now();

        let mut first = tag("TAG-1", true, 0);
        upsert_document(&connection, "t1", &first, now).expect("insert should succeed");
        first.active = false;
        upsert_document(&connection, "t1", &first, now).expect("update should succeed");

        let stored: Tag = get_document(&connection, "t1", "TAG-1")
            .expect("query should succeed")
            .expect("tag should exist");
        assert!(!stored.active);

        let page = find_documents::<Tag>(&connection, "t1", &Filter::new(), Paging::first(10))
            .expect("query should succeed");
        assert_eq!(page.count, 1);
    }

    #[test]
    fn documents_are_tenant_scoped() {
        let connection = migrated("tenants.sqlite");
        let now = Utc::now();
        upsert_document(&connection, "t1", &tag("TAG-1", true, 0), now).expect("insert");
        upsert_document(&connection, "t2", &tag("TAG-1", true, 0), now).expect("insert");

        let missing: Option<Tag> =
            get_document(&connection, "t3", "TAG-1").expect("query should succeed");
        assert_eq!(missing, None);
        assert_eq!(
            list_tenants(&connection, "tags").expect("query should succeed"),
            vec!["t1".to_string(), "t2".to_string()]
        );
    }

    #[test]
    fn finds_with_filters_and_paging() {
        let connection = migrated("filters.sqlite");
        let now = Utc::now();
        for (index, id) in ["A", "B", "C", "D", "E"].iter().enumerate() {
            upsert_document(&connection, "t1", &tag(id, index != 4, index as u32), now)
                .expect("insert should succeed");
        }

        let local = Filter::new().eq("$.issuer", true);
        let first = find_documents::<Tag>(&connection, "t1", &local, Paging::first(3))
            .expect("query should succeed");
        let second = find_documents::<Tag>(&connection, "t1", &local, Paging::first(3).next())
            .expect("query should succeed");

        assert_eq!(first.count, 4);
        assert_eq!(
            first.result.iter().map(|t| t.id.as_str()).collect::<Vec<_>>(),
            vec!["A", "B", "C"]
        );
        assert_eq!(
            second.result.iter().map(|t| t.id.as_str()).collect::<Vec<_>>(),
            vec!["D"]
        );

        let since = Utc.with_ymd_and_hms(2026, 3, 1, 10, 2, 0).unwrap();
        let delta = Filter::new().eq("$.issuer", true).any_of(vec![
            Condition::In("$.id", vec![json!("A")]),
            Condition::After("$.last_changed_on", since),
        ]);
        let changed = find_documents::<Tag>(&connection, "t1", &delta, Paging::first(10))
            .expect("query should succeed");
        assert_eq!(
            changed.result.iter().map(|t| t.id.as_str()).collect::<Vec<_>>(),
            vec!["A", "D"]
        );
    }

    #[test]
    fn null_filters_treat_missing_and_null_alike() {
        let connection = migrated("null-filters.sqlite");
        let now = Utc::now();
        let mut printed = tag("A", true, 0);
        printed.visual_id = Some("0042".to_string());
        upsert_document(&connection, "t1", &printed, now).expect("insert should succeed");
        upsert_document(&connection, "t1", &tag("B", true, 1), now).expect("insert should succeed");

        let with_visual = find_documents::<Tag>(
            &connection,
            "t1",
            &Filter::new().not_null("$.visual_id"),
            Paging::first(10),
        )
        .expect("query should succeed");
        let without_visual = find_documents::<Tag>(
            &connection,
            "t1",
            &Filter::new().is_null("$.visual_id"),
            Paging::first(10),
        )
        .expect("query should succeed");

        assert_eq!(with_visual.result.len(), 1);
        assert_eq!(with_visual.result[0].id, "A");
        assert_eq!(without_visual.result.len(), 1);
        assert_eq!(without_visual.result[0].id, "B");
    }

    #[test]
    fn lock_is_exclusive_until_released_or_expired() {
        let connection = migrated("locks.sqlite");
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap();

        assert!(try_acquire_lock(&connection, "t1", "push-tokens", "a", now, 60).expect("lock"));
        assert!(!try_acquire_lock(&connection, "t1", "push-tokens", "b", now, 60).expect("lock"));
        assert!(try_acquire_lock(&connection, "t2", "push-tokens", "b", now, 60).expect("lock"));

        assert!(!release_lock(&connection, "t1", "push-tokens", "b").expect("release"));
        assert!(release_lock(&connection, "t1", "push-tokens", "a").expect("release"));
        assert!(try_acquire_lock(&connection, "t1", "push-tokens", "b", now, 60).expect("lock"));

        let later = now + Duration::seconds(61);
        assert!(try_acquire_lock(&connection, "t1", "push-tokens", "c", later, 60).expect("lock"));
    }
}
