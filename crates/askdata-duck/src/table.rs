//! Loading a data file into the in-memory `data` table

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use duckdb::{Connection, Result as DuckResult};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{quote_ident, quote_literal, TABLE_NAME};

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("Data file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Not a file: {0}")]
    NotAFile(PathBuf),

    #[error("Unsupported file type `{0}` (expected csv, tsv, txt, parquet or xlsx)")]
    UnsupportedFormat(String),

    #[error("Failed to load {path}: {source}")]
    Database {
        path: PathBuf,
        #[source]
        source: duckdb::Error,
    },

    #[error("No columns found in {0}")]
    NoColumns(PathBuf),
}

/// File formats the loader knows how to read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    Csv,
    Parquet,
    Xlsx,
}

impl SourceFormat {
    /// Pick a format from the file extension
    pub fn from_path(path: &Path) -> Result<Self, LoadError> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();

        match ext.as_str() {
            "csv" | "tsv" | "txt" => Ok(SourceFormat::Csv),
            "parquet" => Ok(SourceFormat::Parquet),
            "xlsx" => Ok(SourceFormat::Xlsx),
            other => Err(LoadError::UnsupportedFormat(other.to_string())),
        }
    }

    /// Table function call that reads `path`
    fn reader(&self, path: &Path) -> String {
        let literal = quote_literal(&path.to_string_lossy());
        match self {
            SourceFormat::Csv => format!("read_csv_auto({})", literal),
            SourceFormat::Parquet => format!("read_parquet({})", literal),
            SourceFormat::Xlsx => format!("read_xlsx({}, header = true)", literal),
        }
    }
}

/// Engine limits applied before loading
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub memory_limit_mb: Option<u64>,
    pub threads: Option<usize>,
}

/// A column of the loaded table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    /// Normalized name used in SQL
    pub name: String,
    /// Header as it appeared in the file
    pub source_name: String,
    /// DuckDB type, e.g. `BIGINT`
    pub engine_type: String,
}

/// The loaded dataset. Immutable once constructed.
pub struct Table {
    conn: Connection,
    source: PathBuf,
    columns: Vec<Column>,
    row_count: usize,
}

impl Table {
    /// Load a data file into a fresh in-memory database
    pub fn load<P: AsRef<Path>>(path: P, options: &LoadOptions) -> Result<Self, LoadError> {
        let path = path.as_ref().to_path_buf();

        let metadata = std::fs::metadata(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => LoadError::NotFound(path.clone()),
            _ => LoadError::Io {
                path: path.clone(),
                source: e,
            },
        })?;
        if !metadata.is_file() {
            return Err(LoadError::NotAFile(path));
        }

        let format = SourceFormat::from_path(&path)?;
        tracing::info!(path = %path.display(), ?format, "loading data file");

        let db_err = |source: duckdb::Error| LoadError::Database {
            path: path.clone(),
            source,
        };

        let conn = Connection::open_in_memory().map_err(db_err)?;
        apply_options(&conn, options).map_err(db_err)?;

        if format == SourceFormat::Xlsx {
            conn.execute_batch("INSTALL excel; LOAD excel;").map_err(db_err)?;
            tracing::debug!("loaded excel extension");
        }

        let source_columns = create_table(&conn, format, &path).map_err(db_err)?;
        if source_columns.is_empty() {
            return Err(LoadError::NoColumns(path));
        }

        let row_count: i64 = conn
            .query_row(
                &format!("SELECT COUNT(*) FROM {}", quote_ident(TABLE_NAME)),
                [],
                |row| row.get(0),
            )
            .map_err(db_err)?;

        lock_down(&conn);

        tracing::info!(
            columns = source_columns.len(),
            rows = row_count,
            "table loaded"
        );

        Ok(Self {
            conn,
            source: path,
            columns: source_columns,
            row_count: row_count as usize,
        })
    }

    pub fn name(&self) -> &str {
        TABLE_NAME
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    #[cfg(test)]
    pub(crate) fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn row_count(&self) -> usize {
        self.row_count
    }

    /// Up to `limit` non-null values of `column`, rendered as text, in table order
    pub fn sample_values(&self, column: &str, limit: usize) -> DuckResult<Vec<String>> {
        let col = quote_ident(column);
        let query = format!(
            "SELECT CAST({col} AS VARCHAR) FROM {} WHERE {col} IS NOT NULL LIMIT {}",
            quote_ident(TABLE_NAME),
            limit
        );
        let mut stmt = self.conn.prepare(&query)?;
        let values = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<DuckResult<Vec<_>>>()?;
        Ok(values)
    }

    pub(crate) fn connection(&self) -> &Connection {
        &self.conn
    }
}

fn apply_options(conn: &Connection, options: &LoadOptions) -> DuckResult<()> {
    if let Some(mb) = options.memory_limit_mb {
        conn.execute_batch(&format!("PRAGMA memory_limit='{}MB'", mb))?;
    }
    if let Some(threads) = options.threads {
        conn.execute_batch(&format!("PRAGMA threads={}", threads))?;
    }
    Ok(())
}

/// Create `data` from the file, renaming columns to their normalized form.
/// Returns the resulting columns in order.
fn create_table(conn: &Connection, format: SourceFormat, path: &Path) -> DuckResult<Vec<Column>> {
    const SOURCE_VIEW: &str = "__askdata_source";

    conn.execute_batch(&format!(
        "CREATE VIEW {} AS SELECT * FROM {}",
        quote_ident(SOURCE_VIEW),
        format.reader(path)
    ))?;

    let mut stmt = conn.prepare(
        "SELECT column_name, data_type \
         FROM information_schema.columns \
         WHERE table_name = ? \
         ORDER BY ordinal_position",
    )?;
    let raw: Vec<(String, String)> = stmt
        .query_map([SOURCE_VIEW], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<DuckResult<Vec<_>>>()?;

    let names = normalize_column_names(raw.iter().map(|(name, _)| name.as_str()));
    let columns: Vec<Column> = raw
        .into_iter()
        .zip(names)
        .map(|((source_name, engine_type), name)| Column {
            name,
            source_name,
            engine_type,
        })
        .collect();

    if columns.is_empty() {
        conn.execute_batch(&format!("DROP VIEW {}", quote_ident(SOURCE_VIEW)))?;
        return Ok(columns);
    }

    let projection = columns
        .iter()
        .map(|c| format!("{} AS {}", quote_ident(&c.source_name), quote_ident(&c.name)))
        .collect::<Vec<_>>()
        .join(", ");

    conn.execute_batch(&format!(
        "CREATE TABLE {} AS SELECT {} FROM {}; DROP VIEW {};",
        quote_ident(TABLE_NAME),
        projection,
        quote_ident(SOURCE_VIEW),
        quote_ident(SOURCE_VIEW)
    ))?;

    for c in columns.iter().filter(|c| c.name != c.source_name) {
        tracing::debug!(from = %c.source_name, to = %c.name, "renamed column");
    }

    Ok(columns)
}

/// Best effort: the safety gate is the primary guard, this only narrows
/// what an approved query could reach.
fn lock_down(conn: &Connection) {
    for setting in ["SET enable_external_access = false", "SET lock_configuration = true"] {
        if let Err(e) = conn.execute_batch(setting) {
            tracing::warn!(error = %e, setting, "could not lock down database configuration");
        }
    }
}

/// Lower-case, trim, and replace spaces, dots and dashes with underscores.
/// Duplicates (case-insensitive, as DuckDB compares identifiers) get a
/// numeric suffix; blank names become `column_<n>`.
pub fn normalize_column_names<'a, I>(names: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut seen = HashSet::new();
    let mut out = Vec::new();

    for (idx, raw) in names.into_iter().enumerate() {
        let mut base: String = raw
            .trim()
            .to_lowercase()
            .chars()
            .map(|c| match c {
                ' ' | '.' | '-' => '_',
                c => c,
            })
            .collect();
        if base.is_empty() {
            base = format!("column_{}", idx + 1);
        }

        let mut name = base.clone();
        let mut suffix = 2;
        while !seen.insert(name.to_lowercase()) {
            name = format!("{}_{}", base, suffix);
            suffix += 1;
        }
        out.push(name);
    }

    out
}
