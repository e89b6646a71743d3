//! SQLite-backed package store implementation.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection};

use super::{
    Checkpoint, ErrorCode, PackageDescriptor, PackageError, PackageFilter, PackageMetadata,
    PackageState, PackageStore, PackageType, SourceIdentity,
};

const COLUMNS: &str = "id, source_path, package_type, owner, grp, platform, state, checkpoint, error_code, error_message, media_ids, metadata, reschedules, retry_count, created_at, updated_at, source_identity";

/// SQLite-backed package store.
pub struct SqlitePackageStore {
    conn: Mutex<Connection>,
}

impl SqlitePackageStore {
    /// Create a new SQLite package store, creating the database file and tables if needed.
    pub fn new(path: &Path) -> Result<Self, PackageError> {
        let conn = Connection::open(path).map_err(|e| PackageError::Database(e.to_string()))?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory SQLite package store (useful for testing).
    pub fn in_memory() -> Result<Self, PackageError> {
        let conn =
            Connection::open_in_memory().map_err(|e| PackageError::Database(e.to_string()))?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn initialize_schema(conn: &Connection) -> Result<(), PackageError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS packages (
                id TEXT PRIMARY KEY,
                source_path TEXT NOT NULL,
                package_type TEXT NOT NULL,
                owner TEXT,
                grp TEXT,
                platform TEXT,
                state TEXT NOT NULL,
                checkpoint TEXT NOT NULL,
                error_code TEXT,
                error_message TEXT,
                media_ids TEXT NOT NULL DEFAULT '[]',
                metadata TEXT NOT NULL DEFAULT '{}',
                reschedules INTEGER NOT NULL DEFAULT 0,
                retry_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                source_identity TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_packages_state ON packages(state);
            CREATE INDEX IF NOT EXISTS idx_packages_source_path ON packages(source_path);
            CREATE INDEX IF NOT EXISTS idx_packages_created_at ON packages(created_at);
            "#,
        )
        .map_err(|e| PackageError::Database(e.to_string()))?;

        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, PackageError> {
        self.conn
            .lock()
            .map_err(|_| PackageError::Database("connection mutex poisoned".to_string()))
    }

    fn build_where_clause(filter: &PackageFilter) -> (String, Vec<Box<dyn rusqlite::ToSql>>) {
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if filter.states.is_empty() {
            return (String::new(), params);
        }

        let placeholders = vec!["?"; filter.states.len()].join(", ");
        for state in &filter.states {
            params.push(Box::new(state.as_str()));
        }

        (format!("WHERE state IN ({})", placeholders), params)
    }

    fn row_to_package(row: &rusqlite::Row) -> rusqlite::Result<PackageDescriptor> {
        let state_tag: String = row.get(6)?;
        let state = PackageState::parse(&state_tag).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                6,
                Type::Text,
                format!("unknown package state: {}", state_tag).into(),
            )
        })?;

        let checkpoint: Checkpoint = json_column(row, 7)?;
        let error_code: Option<ErrorCode> = row
            .get::<_, Option<String>>(8)?
            .and_then(|code| serde_json::from_value(serde_json::Value::String(code)).ok());
        let media_ids: Vec<String> = json_column(row, 10)?;
        let metadata: PackageMetadata = json_column(row, 11)?;

        let source_identity: Option<SourceIdentity> = row
            .get::<_, Option<String>>(16)?
            .and_then(|raw| serde_json::from_str(&raw).ok());
        let created_at_str: String = row.get(14)?;
        let updated_at_str: String = row.get(15)?;

        Ok(PackageDescriptor {
            id: row.get(0)?,
            source_path: PathBuf::from(row.get::<_, String>(1)?),
            source_identity,
            package_type: PackageType::new(row.get::<_, String>(2)?),
            owner: row.get(3)?,
            group: row.get(4)?,
            platform: row.get(5)?,
            state,
            checkpoint,
            error_code,
            error_message: row.get(9)?,
            media_ids,
            metadata,
            reschedules: row.get(12)?,
            retry_count: row.get(13)?,
            created_at: parse_timestamp(&created_at_str),
            updated_at: parse_timestamp(&updated_at_str),
        })
    }

    fn fetch(conn: &Connection, id: &str) -> Result<Option<PackageDescriptor>, PackageError> {
        let result = conn.query_row(
            &format!("SELECT {} FROM packages WHERE id = ?", COLUMNS),
            params![id],
            Self::row_to_package,
        );

        match result {
            Ok(package) => Ok(Some(package)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(PackageError::Database(e.to_string())),
        }
    }
}

fn json_column<T: serde::de::DeserializeOwned>(
    row: &rusqlite::Row,
    idx: usize,
) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, PackageError> {
    serde_json::to_string(value).map_err(|e| PackageError::Database(e.to_string()))
}

// Timestamps are written by us in RFC 3339; a corrupt value falls back to now.
fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

impl PackageStore for SqlitePackageStore {
    fn create(&self, package: &PackageDescriptor) -> Result<(), PackageError> {
        let conn = self.lock()?;

        conn.execute(
            &format!(
                "INSERT INTO packages ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                COLUMNS
            ),
            params![
                package.id,
                package.source_path.to_string_lossy().into_owned(),
                package.package_type.as_str(),
                package.owner,
                package.group,
                package.platform,
                package.state.as_str(),
                to_json(&package.checkpoint)?,
                package.error_code.map(|c| c.as_str()),
                package.error_message,
                to_json(&package.media_ids)?,
                to_json(&package.metadata)?,
                package.reschedules,
                package.retry_count,
                package.created_at.to_rfc3339(),
                package.updated_at.to_rfc3339(),
                package.source_identity.map(|i| to_json(&i)).transpose()?,
            ],
        )
        .map_err(|e| PackageError::Database(e.to_string()))?;

        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<PackageDescriptor>, PackageError> {
        let conn = self.lock()?;
        Self::fetch(&conn, id)
    }

    fn save(&self, package: &PackageDescriptor) -> Result<(), PackageError> {
        let conn = self.lock()?;

        let updated = conn
            .execute(
                "UPDATE packages SET platform = ?, state = ?, checkpoint = ?, error_code = ?, error_message = ?, media_ids = ?, metadata = ?, reschedules = ?, retry_count = ?, updated_at = ? WHERE id = ?",
                params![
                    package.platform,
                    package.state.as_str(),
                    to_json(&package.checkpoint)?,
                    package.error_code.map(|c| c.as_str()),
                    package.error_message,
                    to_json(&package.media_ids)?,
                    to_json(&package.metadata)?,
                    package.reschedules,
                    package.retry_count,
                    Utc::now().to_rfc3339(),
                    package.id,
                ],
            )
            .map_err(|e| PackageError::Database(e.to_string()))?;

        if updated == 0 {
            return Err(PackageError::NotFound(package.id.clone()));
        }

        Ok(())
    }

    fn list(&self, filter: &PackageFilter) -> Result<Vec<PackageDescriptor>, PackageError> {
        let conn = self.lock()?;

        let (where_clause, params) = Self::build_where_clause(filter);

        let sql = format!(
            "SELECT {} FROM packages {} ORDER BY rowid ASC LIMIT ? OFFSET ?",
            COLUMNS, where_clause
        );

        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| PackageError::Database(e.to_string()))?;

        let mut all_params: Vec<Box<dyn rusqlite::ToSql>> = params;
        all_params.push(Box::new(filter.limit));
        all_params.push(Box::new(filter.offset));

        let param_refs: Vec<&dyn rusqlite::ToSql> = all_params.iter().map(|p| p.as_ref()).collect();

        let rows = stmt
            .query_map(param_refs.as_slice(), Self::row_to_package)
            .map_err(|e| PackageError::Database(e.to_string()))?;

        let mut packages = Vec::new();
        for row_result in rows {
            packages.push(row_result.map_err(|e| PackageError::Database(e.to_string()))?);
        }

        Ok(packages)
    }

    fn count(&self, filter: &PackageFilter) -> Result<i64, PackageError> {
        let conn = self.lock()?;

        let (where_clause, params) = Self::build_where_clause(filter);
        let sql = format!("SELECT COUNT(*) FROM packages {}", where_clause);
        let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();

        conn.query_row(&sql, param_refs.as_slice(), |row| row.get(0))
            .map_err(|e| PackageError::Database(e.to_string()))
    }

    fn delete(&self, id: &str) -> Result<PackageDescriptor, PackageError> {
        let conn = self.lock()?;

        let package = Self::fetch(&conn, id)?.ok_or_else(|| PackageError::NotFound(id.to_string()))?;

        conn.execute("DELETE FROM packages WHERE id = ?", params![id])
            .map_err(|e| PackageError::Database(e.to_string()))?;

        Ok(package)
    }

    fn find_by_source(&self, source: &Path) -> Result<Option<PackageDescriptor>, PackageError> {
        let conn = self.lock()?;

        let result = conn.query_row(
            &format!(
                "SELECT {} FROM packages WHERE source_path = ? ORDER BY rowid DESC LIMIT 1",
                COLUMNS
            ),
            params![source.to_string_lossy().into_owned()],
            Self::row_to_package,
        );

        match result {
            Ok(package) => Ok(Some(package)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(PackageError::Database(e.to_string())),
        }
    }
}
