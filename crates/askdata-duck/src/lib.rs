//! DuckDB-backed table, schema inference and query execution
//!
//! A data file is loaded once into an in-memory DuckDB database as a single
//! table named [`TABLE_NAME`]. After loading the engine is locked down and
//! only [`askdata_gate::ApprovedQuery`] values can be executed against it.

mod executor;
mod schema;
mod table;

pub use executor::{QueryExecutionError, QueryExecutor, QueryResult};
pub use schema::{infer_column_type, ColumnSchema, ColumnType, SchemaDescription};
pub use table::{normalize_column_names, Column, LoadError, LoadOptions, SourceFormat, Table};

/// Name of the single table every query runs against
pub const TABLE_NAME: &str = "data";

/// Quote an identifier for DuckDB
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a string literal for DuckDB
pub(crate) fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
