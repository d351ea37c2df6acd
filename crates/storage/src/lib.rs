use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;
use std::time::Duration;

use rusqlite::{
    Connection, params, params_from_iter,
    types::{Value, ValueRef},
};
use tokio::{sync::oneshot, task};
use tracing::{debug, info};

pub mod store;

pub use store::ChatStore;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The underlying medium could not be opened or has gone away.
    /// Fatal to the current call only; callers retry on the next user
    /// action and the process keeps running.
    #[error("storage unavailable at {path}: {reason}")]
    Unavailable { path: PathBuf, reason: String },

    #[error("migration {version} failed: {reason}")]
    MigrationFailed { version: u32, reason: String },

    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    #[error("foreign key violation: {0}")]
    ForeignKeyViolation(String),

    #[error("query failed: {0}")]
    QueryFailed(String),

    #[error("expected one row but found none")]
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum SqlValue {
    #[default]
    Null,
    Integer(i64),
    Text(String),
}

pub trait ToSql: Send + Sync {
    fn to_sql_value(&self) -> SqlValue;
}

impl ToSql for i64 {
    fn to_sql_value(&self) -> SqlValue {
        SqlValue::Integer(*self)
    }
}

impl ToSql for i32 {
    fn to_sql_value(&self) -> SqlValue {
        SqlValue::Integer(i64::from(*self))
    }
}

impl ToSql for String {
    fn to_sql_value(&self) -> SqlValue {
        SqlValue::Text(self.clone())
    }
}

impl ToSql for str {
    fn to_sql_value(&self) -> SqlValue {
        SqlValue::Text(self.to_string())
    }
}

impl<T> ToSql for &T
where
    T: ToSql + ?Sized,
{
    fn to_sql_value(&self) -> SqlValue {
        (**self).to_sql_value()
    }
}

impl<T> ToSql for Option<T>
where
    T: ToSql,
{
    fn to_sql_value(&self) -> SqlValue {
        match self {
            Some(value) => value.to_sql_value(),
            None => SqlValue::Null,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row {
    values: Vec<SqlValue>,
}

impl Row {
    pub fn new(values: Vec<SqlValue>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&SqlValue> {
        self.values.get(index)
    }
}

pub trait FromRow: Sized {
    fn from_row(row: &Row) -> Result<Self, StorageError>;
}

impl FromRow for Row {
    fn from_row(row: &Row) -> Result<Self, StorageError> {
        Ok(row.clone())
    }
}

/// A parameterized SQL statement, used to hand several writes to the
/// writer as one crash-atomic transaction.
#[derive(Debug, Clone)]
pub struct Statement {
    sql: String,
    params: Vec<SqlValue>,
}

impl Statement {
    pub fn new(sql: impl Into<String>, params: &[&dyn ToSql]) -> Self {
        Self {
            sql: sql.into(),
            params: collect_params(params),
        }
    }
}

#[allow(async_fn_in_trait)]
pub trait Database: Send + Sync + 'static {
    async fn execute(&self, sql: &str, params: &[&dyn ToSql]) -> Result<u64, StorageError>;

    /// Execute several statements inside a single transaction on the
    /// writer connection; either all of them become visible or none do.
    async fn execute_batch(&self, statements: Vec<Statement>) -> Result<(), StorageError>;

    async fn query<T: FromRow>(
        &self,
        sql: &str,
        params: &[&dyn ToSql],
    ) -> Result<Vec<T>, StorageError>;

    async fn query_one<T: FromRow>(
        &self,
        sql: &str,
        params: &[&dyn ToSql],
    ) -> Result<T, StorageError>;
}

#[derive(Debug, Clone)]
pub struct SqliteStore {
    path: PathBuf,
    writer: Sender<WriteCommand>,
}

enum WriteCommand {
    Execute {
        sql: String,
        params: Vec<SqlValue>,
        response: oneshot::Sender<Result<u64, StorageError>>,
    },
    Batch {
        statements: Vec<Statement>,
        response: oneshot::Sender<Result<(), StorageError>>,
    },
}

enum WriterState {
    Ready(Connection),
    Failed(String),
}

fn collect_params(params: &[&dyn ToSql]) -> Vec<SqlValue> {
    params.iter().map(|param| param.to_sql_value()).collect()
}

fn sql_value_to_rusqlite_value(value: &SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(integer) => Value::Integer(*integer),
        SqlValue::Text(text) => Value::Text(text.clone()),
    }
}

fn sql_values_to_rusqlite_values(values: &[SqlValue]) -> Vec<Value> {
    values.iter().map(sql_value_to_rusqlite_value).collect()
}

fn value_ref_to_sql_value(value_ref: ValueRef<'_>) -> SqlValue {
    match value_ref {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(integer) => SqlValue::Integer(integer),
        ValueRef::Real(real) => SqlValue::Text(real.to_string()),
        ValueRef::Text(text) => SqlValue::Text(String::from_utf8_lossy(text).into_owned()),
        ValueRef::Blob(bytes) => SqlValue::Text(String::from_utf8_lossy(bytes).into_owned()),
    }
}

/// Map rusqlite failures to the typed taxonomy. Constraint violations
/// carry SQLite extended result codes, which is the only reliable way to
/// tell a duplicate primary key from a missing foreign key at write time.
fn map_sqlite_error(error: rusqlite::Error) -> StorageError {
    if let rusqlite::Error::SqliteFailure(failure, ref message) = error {
        let details = message
            .clone()
            .unwrap_or_else(|| failure.to_string());
        match failure.extended_code {
            rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY | rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE => {
                return StorageError::DuplicateKey(details);
            }
            rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY => {
                return StorageError::ForeignKeyViolation(details);
            }
            _ => {}
        }
    }

    StorageError::QueryFailed(error.to_string())
}

fn open_connection(path: &Path) -> Result<Connection, StorageError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|error| StorageError::Unavailable {
            path: path.to_path_buf(),
            reason: error.to_string(),
        })?;
    }

    Connection::open(path).map_err(|error| StorageError::Unavailable {
        path: path.to_path_buf(),
        reason: error.to_string(),
    })
}

fn configure_connection(connection: &Connection, path: &Path) -> Result<(), StorageError> {
    connection
        .pragma_update(None, "journal_mode", "WAL")
        .map_err(|error| StorageError::Unavailable {
            path: path.to_path_buf(),
            reason: error.to_string(),
        })?;
    connection
        .busy_timeout(Duration::from_secs(5))
        .map_err(|error| StorageError::Unavailable {
            path: path.to_path_buf(),
            reason: error.to_string(),
        })?;
    connection
        .pragma_update(None, "foreign_keys", "ON")
        .map_err(|error| StorageError::Unavailable {
            path: path.to_path_buf(),
            reason: error.to_string(),
        })?;
    Ok(())
}

fn open_configured_connection(path: &Path) -> Result<Connection, StorageError> {
    let connection = open_connection(path)?;
    configure_connection(&connection, path)?;
    Ok(connection)
}

fn execute_statement(
    connection: &Connection,
    sql: &str,
    params: &[SqlValue],
) -> Result<u64, StorageError> {
    let values = sql_values_to_rusqlite_values(params);

    connection
        .execute(sql, params_from_iter(values.iter()))
        .map(|rows_affected| rows_affected as u64)
        .map_err(map_sqlite_error)
}

fn execute_batch_statements(
    connection: &Connection,
    statements: &[Statement],
) -> Result<(), StorageError> {
    let tx = connection
        .unchecked_transaction()
        .map_err(map_sqlite_error)?;

    for statement in statements {
        let values = sql_values_to_rusqlite_values(&statement.params);
        tx.execute(&statement.sql, params_from_iter(values.iter()))
            .map_err(map_sqlite_error)?;
    }

    tx.commit().map_err(map_sqlite_error)
}

fn query_rows(
    connection: &Connection,
    sql: &str,
    params: &[SqlValue],
) -> Result<Vec<Row>, StorageError> {
    let mut statement = connection.prepare(sql).map_err(map_sqlite_error)?;
    let values = sql_values_to_rusqlite_values(params);
    let column_count = statement.column_count();
    let mut rows = statement
        .query(params_from_iter(values.iter()))
        .map_err(map_sqlite_error)?;
    let mut output = Vec::new();

    while let Some(row) = rows.next().map_err(map_sqlite_error)? {
        let mut values = Vec::with_capacity(column_count);
        for index in 0..column_count {
            let value = row.get_ref(index).map_err(map_sqlite_error)?;
            values.push(value_ref_to_sql_value(value));
        }
        output.push(Row::new(values));
    }

    Ok(output)
}

struct Migration {
    version: u32,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    sql: include_str!("../migrations/001_initial.sql"),
}];

fn run_migrations(connection: &Connection) -> Result<(), StorageError> {
    connection
        .execute_batch(
            "CREATE TABLE IF NOT EXISTS _migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            );",
        )
        .map_err(|error| StorageError::MigrationFailed {
            version: 0,
            reason: format!("failed to create _migrations table: {error}"),
        })?;

    for migration in MIGRATIONS {
        let is_applied: i64 = connection
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM _migrations WHERE version = ?1)",
                params![migration.version],
                |row| row.get(0),
            )
            .map_err(|error| StorageError::MigrationFailed {
                version: migration.version,
                reason: format!("failed to query migration state: {error}"),
            })?;

        if is_applied != 0 {
            continue;
        }

        if apply_migration(connection, migration)? {
            info!(version = migration.version, "applied migration");
        } else {
            debug!(
                version = migration.version,
                "migration already applied by a concurrent opener"
            );
        }
    }

    Ok(())
}

fn is_unique_violation(error: &rusqlite::Error) -> bool {
    matches!(
        error,
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                || failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

/// Apply one migration in its own transaction. Several openers may race
/// past the applied check; the version row's primary key decides the
/// winner, and losing is success (the schema is already there). Returns
/// whether this caller was the one that applied it.
fn apply_migration(connection: &Connection, migration: &Migration) -> Result<bool, StorageError> {
    let tx = connection
        .unchecked_transaction()
        .map_err(|error| StorageError::MigrationFailed {
            version: migration.version,
            reason: format!("failed to begin transaction: {error}"),
        })?;

    if let Err(error) = tx.execute_batch(migration.sql) {
        if is_unique_violation(&error) {
            return Ok(false);
        }
        return Err(StorageError::MigrationFailed {
            version: migration.version,
            reason: error.to_string(),
        });
    }

    match tx.execute(
        "INSERT INTO _migrations (version) VALUES (?1)",
        params![migration.version],
    ) {
        Ok(_) => {}
        // Dropping the transaction rolls our copy back.
        Err(error) if is_unique_violation(&error) => return Ok(false),
        Err(error) => {
            return Err(StorageError::MigrationFailed {
                version: migration.version,
                reason: format!("failed to record migration: {error}"),
            });
        }
    }

    tx.commit().map_err(|error| StorageError::MigrationFailed {
        version: migration.version,
        reason: format!("failed to commit migration: {error}"),
    })?;

    Ok(true)
}

fn run_writer(path: PathBuf, receiver: Receiver<WriteCommand>) {
    let mut state = match open_configured_connection(&path) {
        Ok(connection) => WriterState::Ready(connection),
        Err(error) => WriterState::Failed(error.to_string()),
    };

    while let Ok(command) = receiver.recv() {
        match command {
            WriteCommand::Execute {
                sql,
                params,
                response,
            } => {
                let result = match &mut state {
                    WriterState::Ready(connection) => execute_statement(connection, &sql, &params),
                    WriterState::Failed(reason) => Err(StorageError::Unavailable {
                        path: path.clone(),
                        reason: reason.clone(),
                    }),
                };

                let _ = response.send(result);
            }
            WriteCommand::Batch {
                statements,
                response,
            } => {
                let result = match &mut state {
                    WriterState::Ready(connection) => {
                        execute_batch_statements(connection, &statements)
                    }
                    WriterState::Failed(reason) => Err(StorageError::Unavailable {
                        path: path.clone(),
                        reason: reason.clone(),
                    }),
                };

                let _ = response.send(result);
            }
        }
    }
}

impl SqliteStore {
    /// Open (or create) the store at `path` and bring the schema up to
    /// date. Idempotent: only the first opener performs schema creation,
    /// later callers observe the store ready on return.
    pub async fn open(path: &Path) -> Result<Self, StorageError> {
        let path = path.to_path_buf();
        let setup_path = path.clone();

        task::spawn_blocking(move || {
            let connection = open_configured_connection(&setup_path)?;
            run_migrations(&connection)?;
            Ok(())
        })
        .await
        .map_err(|error| StorageError::Unavailable {
            path: path.clone(),
            reason: format!("failed to join storage setup task: {error}"),
        })??;

        let (writer, receiver) = mpsc::channel();
        let writer_path = path.clone();

        thread::Builder::new()
            .name("storage_writer".to_string())
            .spawn(move || run_writer(writer_path, receiver))
            .map_err(|error| StorageError::Unavailable {
                path: path.clone(),
                reason: format!("failed to spawn storage_writer thread: {error}"),
            })?;

        Ok(Self { path, writer })
    }
}

impl Database for SqliteStore {
    async fn execute(&self, sql: &str, params: &[&dyn ToSql]) -> Result<u64, StorageError> {
        let (response_tx, response_rx) = oneshot::channel();
        let command = WriteCommand::Execute {
            sql: sql.to_string(),
            params: collect_params(params),
            response: response_tx,
        };

        self.writer.send(command).map_err(|_| {
            StorageError::QueryFailed("storage writer thread is unavailable".to_string())
        })?;

        response_rx.await.map_err(|_| {
            StorageError::QueryFailed(
                "storage writer thread terminated before responding".to_string(),
            )
        })?
    }

    async fn execute_batch(&self, statements: Vec<Statement>) -> Result<(), StorageError> {
        let (response_tx, response_rx) = oneshot::channel();
        let command = WriteCommand::Batch {
            statements,
            response: response_tx,
        };

        self.writer.send(command).map_err(|_| {
            StorageError::QueryFailed("storage writer thread is unavailable".to_string())
        })?;

        response_rx.await.map_err(|_| {
            StorageError::QueryFailed(
                "storage writer thread terminated before responding".to_string(),
            )
        })?
    }

    async fn query<T: FromRow>(
        &self,
        sql: &str,
        params: &[&dyn ToSql],
    ) -> Result<Vec<T>, StorageError> {
        let sql = sql.to_string();
        let params = collect_params(params);
        let path = self.path.clone();
        let rows = task::spawn_blocking(move || {
            let connection = open_configured_connection(&path)?;
            query_rows(&connection, &sql, &params)
        })
        .await
        .map_err(|error| {
            StorageError::QueryFailed(format!("failed to join query task: {error}"))
        })??;

        rows.iter().map(T::from_row).collect()
    }

    async fn query_one<T: FromRow>(
        &self,
        sql: &str,
        params: &[&dyn ToSql],
    ) -> Result<T, StorageError> {
        let mut rows = self.query(sql, params).await?;
        if rows.is_empty() {
            return Err(StorageError::NotFound);
        }

        Ok(rows.remove(0))
    }
}
