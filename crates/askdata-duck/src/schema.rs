//! Schema inference for prompt context

use std::fmt;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::table::{LoadError, Table};

/// Coarse column type shown to the model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Integer,
    Float,
    Text,
    Date,
    Boolean,
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ColumnType::Integer => "integer",
            ColumnType::Float => "float",
            ColumnType::Text => "text",
            ColumnType::Date => "date",
            ColumnType::Boolean => "boolean",
        };
        f.write_str(s)
    }
}

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%d.%m.%Y", "%m/%d/%Y"];

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
];

/// Infer a column type from sampled non-null values.
///
/// Boolean if every sample is `true`/`false`, numeric if every sample is a
/// number (float when any has a fraction point or exponent), date if every
/// sample matches one of the common date formats, text otherwise.
pub fn infer_column_type<S: AsRef<str>>(samples: &[S]) -> ColumnType {
    let values: Vec<&str> = samples.iter().map(|s| s.as_ref().trim()).collect();

    if values.is_empty() || values.iter().any(|v| v.is_empty()) {
        return ColumnType::Text;
    }

    if values
        .iter()
        .all(|v| v.eq_ignore_ascii_case("true") || v.eq_ignore_ascii_case("false"))
    {
        return ColumnType::Boolean;
    }

    if values.iter().all(|v| is_number(v)) {
        if values.iter().any(|v| v.contains(['.', 'e', 'E'])) {
            return ColumnType::Float;
        }
        return ColumnType::Integer;
    }

    if values.iter().all(|v| is_date(v)) {
        return ColumnType::Date;
    }

    ColumnType::Text
}

fn is_number(value: &str) -> bool {
    // f64 parsing also accepts "inf" and "NaN"
    let numeric_chars = value
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, '+' | '-' | '.' | 'e' | 'E'));
    numeric_chars && value.chars().any(|c| c.is_ascii_digit()) && value.parse::<f64>().is_ok()
}

fn is_date(value: &str) -> bool {
    DATE_FORMATS
        .iter()
        .any(|fmt| NaiveDate::parse_from_str(value, fmt).is_ok())
        || DATETIME_FORMATS
            .iter()
            .any(|fmt| NaiveDateTime::parse_from_str(value, fmt).is_ok())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    pub column_type: ColumnType,
    pub engine_type: String,
    pub samples: Vec<String>,
}

/// Column name to inferred type mapping, plus enough context for a prompt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDescription {
    pub table: String,
    pub row_count: usize,
    pub columns: Vec<ColumnSchema>,
}

impl SchemaDescription {
    /// Sample up to `sample_size` non-null values per column and infer types
    pub fn infer(table: &Table, sample_size: usize) -> Result<Self, LoadError> {
        let mut columns = Vec::with_capacity(table.columns().len());

        for column in table.columns() {
            let samples = table
                .sample_values(&column.name, sample_size)
                .map_err(|source| LoadError::Database {
                    path: table.source().to_path_buf(),
                    source,
                })?;
            let column_type = infer_column_type(&samples);
            tracing::debug!(
                column = %column.name,
                engine_type = %column.engine_type,
                inferred = %column_type,
                sampled = samples.len(),
                "inferred column type"
            );
            columns.push(ColumnSchema {
                name: column.name.clone(),
                column_type,
                engine_type: column.engine_type.clone(),
                samples,
            });
        }

        Ok(Self {
            table: table.name().to_string(),
            row_count: table.row_count(),
            columns,
        })
    }

    #[cfg(test)]
    pub(crate) fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Render as prompt context, with at most `max_samples` samples per
    /// column, each cut to 20 characters
    pub fn to_prompt(&self, max_samples: usize) -> String {
        let mut lines = vec![format!("TABLE: {} ({} rows)", self.table, self.row_count)];

        for col in &self.columns {
            let samples: Vec<String> = col
                .samples
                .iter()
                .take(max_samples)
                .map(|s| s.chars().take(20).collect())
                .collect();
            let samples = serde_json::to_string(&samples).unwrap_or_else(|_| "[]".to_string());
            lines.push(format!(
                "- {} ({}, engine type {}) samples={}",
                col.name, col.column_type, col.engine_type, samples
            ));
        }

        lines.join("\n")
    }
}
