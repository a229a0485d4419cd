//! Relational audit log for key operations.
//!
//! Every lifecycle operation writes one row. Sensitive values inside the
//! details payload are masked centrally (see [`mask_details`]) and the masked
//! copy is stored alongside the raw details for high-severity events.

use std::fmt;

use chrono::Utc;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool};
use diesel::SqliteConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use serde_json::Value;
use tracing::{info, warn};

use crate::core::keys::crypto::mask_secret;
use crate::error::{Error, Result};

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

/// Database connection pool type alias.
pub type DbPool = Pool<ConnectionManager<SqliteConnection>>;

mod schema {
    diesel::table! {
        audit_log (id) {
            id -> Nullable<Integer>,
            user_id -> Text,
            action -> Text,
            resource_type -> Text,
            resource_id -> Text,
            details -> Text,
            masked_details -> Nullable<Text>,
            ip -> Nullable<Text>,
            severity -> Text,
            status -> Text,
            created_at -> Text,
        }
    }
}

use schema::audit_log;

/// How loudly an audit event should be surfaced downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Normal,
    High,
    Critical,
}

impl Severity {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Normal => "normal",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One audit event as submitted by the key manager.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub user_id: String,
    pub action: String,
    pub resource_type: String,
    pub resource_id: String,
    pub details: Value,
    pub ip: Option<String>,
    pub severity: Severity,
    pub status: &'static str,
}

impl AuditEntry {
    /// A successful key operation.
    pub fn key_op(
        user_id: impl Into<String>,
        action: impl Into<String>,
        resource_id: impl Into<String>,
        details: Value,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            action: action.into(),
            resource_type: "api_key".into(),
            resource_id: resource_id.into(),
            details,
            ip: None,
            severity: Severity::Normal,
            status: "success",
        }
    }

    #[must_use]
    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    #[must_use]
    pub fn with_ip(mut self, ip: Option<String>) -> Self {
        self.ip = ip;
        self
    }

    #[must_use]
    pub fn failed(mut self) -> Self {
        self.status = "failure";
        self
    }
}

#[derive(Insertable)]
#[diesel(table_name = audit_log)]
struct NewAuditRow {
    user_id: String,
    action: String,
    resource_type: String,
    resource_id: String,
    details: String,
    masked_details: Option<String>,
    ip: Option<String>,
    severity: String,
    status: String,
    created_at: String,
}

/// One persisted audit row.
#[derive(Queryable, Selectable, Debug, Clone)]
#[diesel(table_name = audit_log)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct AuditRow {
    pub id: Option<i32>,
    pub user_id: String,
    pub action: String,
    pub resource_type: String,
    pub resource_id: String,
    pub details: String,
    pub masked_details: Option<String>,
    pub ip: Option<String>,
    pub severity: String,
    pub status: String,
    pub created_at: String,
}

/// Create a connection pool for the given sqlite database URL.
///
/// An in-memory database gets a single connection: every pooled connection
/// to `:memory:` would otherwise be its own empty database.
pub fn create_pool(database_url: &str) -> Result<DbPool> {
    let manager = ConnectionManager::<SqliteConnection>::new(database_url);
    let max_size = if database_url.contains(":memory:") { 1 } else { 5 };
    Pool::builder()
        .max_size(max_size)
        .build(manager)
        .map_err(|e| Error::Store(format!("audit pool: {e}")))
}

/// Run pending migrations.
pub fn run_migrations(pool: &DbPool) -> Result<()> {
    let mut conn = pool
        .get()
        .map_err(|e| Error::Store(format!("audit connection: {e}")))?;
    conn.run_pending_migrations(MIGRATIONS)
        .map_err(|e| Error::Store(format!("audit migrations: {e}")))?;
    Ok(())
}

/// Field names whose values are always masked in audit details.
const SENSITIVE_FIELDS: &[&str] = &["material", "api_key", "api_secret", "secret", "token"];

/// Return a copy of `details` with sensitive values masked (first four and
/// last four characters kept, middle starred). Recurses into objects and
/// arrays.
#[must_use]
pub fn mask_details(details: &Value) -> Value {
    match details {
        Value::Object(map) => {
            let masked = map
                .iter()
                .map(|(key, value)| {
                    if SENSITIVE_FIELDS.contains(&key.as_str()) {
                        let rendered = match value {
                            Value::String(s) => s.clone(),
                            other => other.to_string(),
                        };
                        (key.clone(), Value::String(mask_secret(&rendered)))
                    } else {
                        (key.clone(), mask_details(value))
                    }
                })
                .collect();
            Value::Object(masked)
        }
        Value::Array(items) => Value::Array(items.iter().map(mask_details).collect()),
        other => other.clone(),
    }
}

/// Audit log writer.
pub struct AuditLog {
    pool: DbPool,
}

impl AuditLog {
    /// Open (and migrate) the audit database at `database_url`.
    pub fn open(database_url: &str) -> Result<Self> {
        let pool = create_pool(database_url)?;
        run_migrations(&pool)?;
        info!(database = database_url, "Audit log ready");
        Ok(Self { pool })
    }

    /// Write one audit row.
    ///
    /// High and critical entries also store the masked rendering of their
    /// details, which is what downstream consumers see.
    pub fn record(&self, entry: &AuditEntry) -> Result<()> {
        let details = entry.details.to_string();
        let masked_details = if entry.severity >= Severity::High {
            Some(mask_details(&entry.details).to_string())
        } else {
            None
        };

        if entry.severity >= Severity::High {
            warn!(
                action = %entry.action,
                resource_id = %entry.resource_id,
                severity = %entry.severity,
                "High-severity key event"
            );
        }

        let row = NewAuditRow {
            user_id: entry.user_id.clone(),
            action: entry.action.clone(),
            resource_type: entry.resource_type.clone(),
            resource_id: entry.resource_id.clone(),
            details,
            masked_details,
            ip: entry.ip.clone(),
            severity: entry.severity.as_str().to_string(),
            status: entry.status.to_string(),
            created_at: Utc::now().to_rfc3339(),
        };

        let mut conn = self
            .pool
            .get()
            .map_err(|e| Error::Store(format!("audit connection: {e}")))?;
        diesel::insert_into(audit_log::table)
            .values(&row)
            .execute(&mut conn)
            .map_err(|e| Error::Store(format!("audit insert: {e}")))?;
        Ok(())
    }

    /// Most recent rows, newest first.
    pub fn recent(&self, limit: i64) -> Result<Vec<AuditRow>> {
        let mut conn = self
            .pool
            .get()
            .map_err(|e| Error::Store(format!("audit connection: {e}")))?;
        audit_log::table
            .order(audit_log::id.desc())
            .limit(limit)
            .select(AuditRow::as_select())
            .load(&mut conn)
            .map_err(|e| Error::Store(format!("audit query: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn memory_log() -> AuditLog {
        AuditLog::open(":memory:").unwrap()
    }

    #[test]
    fn record_and_read_back() {
        let log = memory_log();
        log.record(&AuditEntry::key_op(
            "alice",
            "api_key_create",
            "key-1",
            json!({"venue": "binance"}),
        ))
        .unwrap();

        let rows = log.recent(10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].action, "api_key_create");
        assert_eq!(rows[0].severity, "normal");
        assert!(rows[0].masked_details.is_none());
    }

    #[test]
    fn high_severity_rows_store_masked_details() {
        let log = memory_log();
        let entry = AuditEntry::key_op(
            "alice",
            "api_key_compromised",
            "key-1",
            json!({"material": "tw_abcdef1234567890_9999", "venue": "binance"}),
        )
        .with_severity(Severity::Critical);
        log.record(&entry).unwrap();

        let rows = log.recent(1).unwrap();
        let masked = rows[0].masked_details.as_ref().unwrap();
        assert!(!masked.contains("tw_abcdef1234567890_9999"));
        assert!(masked.contains("tw_a"));
        assert!(masked.contains("9999"));
        // Raw details retain the full value for forensics.
        assert!(rows[0].details.contains("tw_abcdef1234567890_9999"));
    }

    #[test]
    fn mask_details_recurses_and_targets_fields() {
        let details = json!({
            "material": "abcd1234efgh5678",
            "nested": {"api_secret": "ssssssssssssss", "note": "keep"},
            "list": [{"token": "tok_0123456789"}],
            "key_id": "not-a-secret",
        });
        let masked = mask_details(&details);
        assert_eq!(masked["material"], "abcd********5678");
        assert_eq!(masked["nested"]["note"], "keep");
        assert_eq!(masked["key_id"], "not-a-secret");
        let token = masked["list"][0]["token"].as_str().unwrap();
        assert!(token.starts_with("tok_"));
        assert!(token.contains('*'));

        let secret = masked["nested"]["api_secret"].as_str().unwrap();
        assert!(secret.contains('*'));
    }

    #[test]
    fn rows_come_back_newest_first() {
        let log = memory_log();
        for i in 0..3 {
            log.record(&AuditEntry::key_op(
                "alice",
                format!("action_{i}"),
                "key-1",
                json!({}),
            ))
            .unwrap();
        }
        let rows = log.recent(2).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].action, "action_2");
        assert_eq!(rows[1].action, "action_1");
    }
}
