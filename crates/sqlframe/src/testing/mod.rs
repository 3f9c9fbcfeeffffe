//! Testing infrastructure.
//!
//! - `MockEngine`: an in-memory, scripted [`QueryExecutor`] which records
//!   every statement it receives
//! - `init_test_tracing`: installs a fmt subscriber honouring `RUST_LOG`
//! - `LogCapture`: a thread-local subscriber recording formatted events

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sqlframe_api::{ColumnDescription, EngineError, FetchMode, QueryResult};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::executor::QueryExecutor;
use crate::ident::unquote_ident;

/// Install a subscriber for tests. Safe to call more than once.
pub fn init_test_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_test_writer())
        .try_init();
}

/// Formatted log output of the current thread, for asserting on warnings.
///
/// Events are recorded until the returned guard is dropped.
#[derive(Clone, Debug, Default)]
pub struct LogCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl LogCapture {
    pub fn install() -> (Self, tracing::subscriber::DefaultGuard) {
        let capture = Self::default();
        let writer = capture.clone();
        let subscriber = fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::INFO)
            .finish();
        let guard = tracing::subscriber::set_default(subscriber);
        (capture, guard)
    }

    pub fn contents(&self) -> String {
        self.buffer
            .lock()
            .map(|b| String::from_utf8_lossy(&b).into_owned())
            .unwrap_or_default()
    }
}

impl io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Ok(mut buffer) = self.buffer.lock() {
            buffer.extend_from_slice(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A statement received by [`MockEngine`].
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutedStatement {
    pub sql: String,
    pub purpose: String,
    pub fetch: FetchMode,
}

/// A scripted engine.
///
/// Statements are answered in this order:
/// 1. rejected when they contain a registered failure substring
/// 2. a canned result whose substring they contain
/// 3. type probes (`SELECT <expr> AS <probe_alias> FROM ...`): the first type
///    rule whose substring appears in `<expr>`, the declared type when
///    `<expr>` is a bare known column, otherwise the default type
/// 4. `SELECT * FROM <table> LIMIT 0` for registered tables
///
/// Anything else is rejected.
#[derive(Debug)]
pub struct MockEngine {
    tables: HashMap<String, Vec<ColumnDescription>>,
    type_rules: Vec<(String, String)>,
    default_type: String,
    failures: Vec<(String, String)>,
    responses: Vec<(String, QueryResult)>,
    probe_alias: String,
    log: Mutex<Vec<ExecutedStatement>>,
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEngine {
    pub fn new() -> Self {
        Self {
            tables: HashMap::new(),
            type_rules: Vec::new(),
            default_type: "float".to_string(),
            failures: Vec::new(),
            responses: Vec::new(),
            probe_alias: "probe".to_string(),
            log: Mutex::new(Vec::new()),
        }
    }

    pub fn with_table(mut self, name: &str, columns: &[(&str, &str)]) -> Self {
        let columns = columns
            .iter()
            .map(|(n, t)| ColumnDescription::new(*n, *t))
            .collect();
        self.tables.insert(name.to_string(), columns);
        self
    }

    /// Probes whose expression contains `pattern` have type `type_name`.
    pub fn with_type_rule(mut self, pattern: &str, type_name: &str) -> Self {
        self.type_rules
            .push((pattern.to_string(), type_name.to_string()));
        self
    }

    pub fn with_default_type(mut self, type_name: &str) -> Self {
        self.default_type = type_name.to_string();
        self
    }

    /// Reject every statement containing `pattern`.
    pub fn with_failure(mut self, pattern: &str, message: &str) -> Self {
        self.failures
            .push((pattern.to_string(), message.to_string()));
        self
    }

    pub fn with_response(mut self, pattern: &str, result: QueryResult) -> Self {
        self.responses.push((pattern.to_string(), result));
        self
    }

    pub fn with_probe_alias(mut self, alias: &str) -> Self {
        self.probe_alias = alias.to_string();
        self
    }

    pub fn statements(&self) -> Vec<ExecutedStatement> {
        self.log.lock().map(|log| log.clone()).unwrap_or_default()
    }

    pub fn statement_count(&self) -> usize {
        self.log.lock().map(|log| log.len()).unwrap_or_default()
    }

    pub fn last_sql(&self) -> Option<String> {
        self.statements().last().map(|s| s.sql.clone())
    }

    pub fn clear_log(&self) {
        if let Ok(mut log) = self.log.lock() {
            log.clear();
        }
    }

    fn probe_expression<'s>(&self, sql: &'s str) -> Option<&'s str> {
        let marker = format!(" AS {} FROM ", self.probe_alias);
        let body = sql.strip_prefix("SELECT ")?;
        body.find(&marker).map(|end| &body[..end])
    }

    fn column_type(&self, name: &str) -> Option<&str> {
        let name = unquote_ident(name);
        self.tables
            .values()
            .flatten()
            .find(|c| c.name == name)
            .map(|c| c.type_name.as_str())
    }

    fn answer(&self, sql: &str) -> Result<QueryResult, EngineError> {
        if let Some((_, message)) = self.failures.iter().find(|(p, _)| sql.contains(p.as_str())) {
            return Err(EngineError::Rejected(message.clone()));
        }
        if let Some((_, result)) = self.responses.iter().find(|(p, _)| sql.contains(p.as_str())) {
            return Ok(result.clone());
        }
        if let Some(expr) = self.probe_expression(sql) {
            let type_name = self
                .type_rules
                .iter()
                .find(|(p, _)| expr.contains(p.as_str()))
                .map(|(_, t)| t.as_str())
                .or_else(|| self.column_type(expr))
                .unwrap_or(self.default_type.as_str());
            return Ok(QueryResult::describe(vec![ColumnDescription::new(
                self.probe_alias.clone(),
                type_name,
            )]));
        }
        let table = sql
            .strip_prefix("SELECT * FROM ")
            .and_then(|rest| rest.strip_suffix(" LIMIT 0"));
        if let Some(columns) = table.and_then(|t| self.tables.get(t)) {
            return Ok(QueryResult::describe(columns.clone()));
        }
        Err(EngineError::Rejected(format!("unexpected statement: {sql}")))
    }
}

#[async_trait]
impl QueryExecutor for MockEngine {
    async fn execute(
        &self,
        sql: &str,
        purpose: &str,
        fetch: FetchMode,
    ) -> Result<QueryResult, EngineError> {
        if let Ok(mut log) = self.log.lock() {
            log.push(ExecutedStatement {
                sql: sql.to_string(),
                purpose: purpose.to_string(),
                fetch,
            });
        }
        self.answer(sql)
    }
}
