use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::field::{Field, Visit};
use tracing::span;
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// A warn+ diagnostic persisted to SQLite.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DiagnosticRecord {
    pub id: i64,
    pub timestamp: String,
    pub level: String,
    pub target: String,
    pub message: String,
    pub fields: Option<String>,
    pub client_token: Option<String>,
    pub conn: Option<String>,
}

/// Filter for searching persisted diagnostics.
#[derive(Clone, Debug, Default)]
pub struct DiagnosticQuery {
    pub level: Option<String>,
    pub target: Option<String>,
    pub client_token: Option<String>,
    pub since: Option<String>,
    pub limit: Option<u32>,
}

/// SQLite sink for connection failures, malformed frames and other warn+ events.
pub struct DiagnosticSink {
    conn: Mutex<Connection>,
}

impl DiagnosticSink {
    pub fn open(db_path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        Self::with_connection(Connection::open(db_path)?)
    }

    pub fn in_memory() -> Result<Self, rusqlite::Error> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, rusqlite::Error> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             CREATE TABLE IF NOT EXISTS diagnostics (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 timestamp TEXT NOT NULL,
                 level TEXT NOT NULL,
                 target TEXT NOT NULL,
                 message TEXT NOT NULL,
                 fields TEXT,
                 client_token TEXT,
                 conn TEXT
             );
             CREATE INDEX IF NOT EXISTS idx_diag_level ON diagnostics(level);
             CREATE INDEX IF NOT EXISTS idx_diag_token ON diagnostics(client_token);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Returns whether the row was written. Failures go to stderr, since
    /// logging them through tracing would feed back into this sink.
    fn insert(&self, record: &DiagnosticInsert) -> bool {
        let conn = self.conn.lock();
        let result = conn.execute(
            "INSERT INTO diagnostics (timestamp, level, target, message, fields, client_token, conn)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                record.timestamp,
                record.level,
                record.target,
                record.message,
                record.fields,
                record.client_token,
                record.conn,
            ],
        );
        match result {
            Ok(_) => true,
            Err(e) => {
                eprintln!("vigil-telemetry: failed to persist diagnostic: {e}");
                false
            }
        }
    }

    pub fn query(&self, q: &DiagnosticQuery) -> Result<Vec<DiagnosticRecord>, rusqlite::Error> {
        let conn = self.conn.lock();
        let mut sql = String::from(
            "SELECT id, timestamp, level, target, message, fields, client_token, conn FROM diagnostics WHERE 1=1",
        );
        let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(level) = &q.level {
            sql.push_str(&format!(" AND level = ?{}", params.len() + 1));
            params.push(Box::new(level.clone()));
        }
        if let Some(target) = &q.target {
            sql.push_str(&format!(" AND target LIKE ?{}", params.len() + 1));
            params.push(Box::new(format!("%{target}%")));
        }
        if let Some(token) = &q.client_token {
            sql.push_str(&format!(" AND client_token = ?{}", params.len() + 1));
            params.push(Box::new(token.clone()));
        }
        if let Some(since) = &q.since {
            sql.push_str(&format!(" AND timestamp >= ?{}", params.len() + 1));
            params.push(Box::new(since.clone()));
        }

        sql.push_str(" ORDER BY id DESC");
        sql.push_str(&format!(" LIMIT {}", q.limit.unwrap_or(100)));

        let param_refs: Vec<&dyn rusqlite::types::ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(param_refs.as_slice(), |row| {
            Ok(DiagnosticRecord {
                id: row.get(0)?,
                timestamp: row.get(1)?,
                level: row.get(2)?,
                target: row.get(3)?,
                message: row.get(4)?,
                fields: row.get(5)?,
                client_token: row.get(6)?,
                conn: row.get(7)?,
            })
        })?;

        rows.collect()
    }

    pub fn count(&self) -> Result<i64, rusqlite::Error> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM diagnostics", [], |row| row.get(0))
    }
}

struct DiagnosticInsert {
    timestamp: String,
    level: String,
    target: String,
    message: String,
    fields: Option<String>,
    client_token: Option<String>,
    conn: Option<String>,
}

/// tracing Layer that writes warn+ events to the diagnostic sink.
pub struct DiagnosticLayer {
    sink: Arc<DiagnosticSink>,
}

impl DiagnosticLayer {
    pub fn new(sink: Arc<DiagnosticSink>) -> Self {
        Self { sink }
    }
}

/// Pulls the message and correlation fields out of an event or span.
#[derive(Default)]
struct FieldVisitor {
    message: Option<String>,
    fields: serde_json::Map<String, serde_json::Value>,
    client_token: Option<String>,
    conn: Option<String>,
}

impl FieldVisitor {
    fn put(&mut self, name: &str, value: String) {
        match name {
            "message" => self.message = Some(value),
            "client_token" => self.client_token = Some(value),
            "conn" => self.conn = Some(value),
            other => {
                self.fields
                    .insert(other.to_string(), serde_json::Value::String(value));
            }
        }
    }
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let val = format!("{value:?}");
        let val = if field.name() == "message" {
            val
        } else {
            val.trim_matches('"').to_string()
        };
        self.put(field.name(), val);
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.put(field.name(), value.to_string());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        if field.name() == "conn" {
            self.conn = Some(value.to_string());
        } else {
            self.fields
                .insert(field.name().to_string(), serde_json::Value::Number(value.into()));
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.fields
            .insert(field.name().to_string(), serde_json::Value::Number(value.into()));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.fields
            .insert(field.name().to_string(), serde_json::Value::Bool(value));
    }
}

/// Stored on spans so child events inherit the correlation fields.
struct SpanCorrelation {
    client_token: Option<String>,
    conn: Option<String>,
}

impl<S> Layer<S> for DiagnosticLayer
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fn on_event(&self, event: &tracing::Event<'_>, ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        if level > tracing::Level::WARN {
            return;
        }

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        if visitor.client_token.is_none() || visitor.conn.is_none() {
            if let Some(scope) = ctx.event_scope(event) {
                for span in scope {
                    let extensions = span.extensions();
                    if let Some(corr) = extensions.get::<SpanCorrelation>() {
                        if visitor.client_token.is_none() {
                            visitor.client_token.clone_from(&corr.client_token);
                        }
                        if visitor.conn.is_none() {
                            visitor.conn.clone_from(&corr.conn);
                        }
                    }
                }
            }
        }

        let fields = if visitor.fields.is_empty() {
            None
        } else {
            serde_json::to_string(&visitor.fields).ok()
        };

        self.sink.insert(&DiagnosticInsert {
            timestamp: Utc::now().to_rfc3339(),
            level: level.to_string().to_uppercase(),
            target: event.metadata().target().to_string(),
            message: visitor.message.unwrap_or_default(),
            fields,
            client_token: visitor.client_token,
            conn: visitor.conn,
        });
    }

    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        attrs.record(&mut visitor);

        if visitor.client_token.is_some() || visitor.conn.is_some() {
            if let Some(span) = ctx.span(id) {
                span.extensions_mut().insert(SpanCorrelation {
                    client_token: visitor.client_token,
                    conn: visitor.conn,
                });
            }
        }
    }
}
