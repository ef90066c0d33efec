//! Running approved queries against the loaded table

use askdata_gate::ApprovedQuery;
use chrono::{DateTime, NaiveTime};
use duckdb::types::{TimeUnit, Value as DuckValue};
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::table::Table;

/// Engine failure on an approved query. Displays DuckDB's message as-is.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct QueryExecutionError(#[from] duckdb::Error);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl QueryResult {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// The single value of a one-row, one-column result (e.g. `COUNT(*)`)
    pub fn scalar(&self) -> Option<&Value> {
        match (self.columns.len(), self.rows.as_slice()) {
            (1, [row]) => row.first(),
            _ => None,
        }
    }
}

pub struct QueryExecutor<'t> {
    table: &'t Table,
}

impl<'t> QueryExecutor<'t> {
    pub fn new(table: &'t Table) -> Self {
        Self { table }
    }

    /// Execute the query and collect every row. No retry, no rewriting.
    pub fn execute(&self, query: &ApprovedQuery) -> Result<QueryResult, QueryExecutionError> {
        let started = std::time::Instant::now();
        let conn = self.table.connection();

        let mut stmt = conn.prepare(query.as_str())?;
        let mut rows = stmt.query([])?;

        let columns: Vec<String> = rows
            .as_ref()
            .map(|stmt| stmt.column_names())
            .unwrap_or_default();

        let mut result_rows = Vec::new();
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(columns.len());
            for i in 0..columns.len() {
                values.push(value_to_json(row.get::<_, DuckValue>(i)?));
            }
            result_rows.push(values);
        }

        tracing::debug!(
            rows = result_rows.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "query executed"
        );

        Ok(QueryResult {
            columns,
            rows: result_rows,
        })
    }
}

fn value_to_json(value: DuckValue) -> Value {
    match value {
        DuckValue::Null => Value::Null,
        DuckValue::Boolean(b) => Value::Bool(b),
        DuckValue::TinyInt(i) => json!(i),
        DuckValue::SmallInt(i) => json!(i),
        DuckValue::Int(i) => json!(i),
        DuckValue::BigInt(i) => json!(i),
        DuckValue::HugeInt(i) => match i64::try_from(i) {
            Ok(small) => json!(small),
            Err(_) => Value::String(i.to_string()),
        },
        DuckValue::UTinyInt(i) => json!(i),
        DuckValue::USmallInt(i) => json!(i),
        DuckValue::UInt(i) => json!(i),
        DuckValue::UBigInt(i) => json!(i),
        DuckValue::Float(f) => json!(f),
        DuckValue::Double(f) => json!(f),
        DuckValue::Decimal(d) => {
            let text = d.to_string();
            match text.parse::<f64>() {
                Ok(f) => json!(f),
                Err(_) => Value::String(text),
            }
        }
        DuckValue::Text(s) | DuckValue::Enum(s) => Value::String(s),
        DuckValue::Blob(b) => Value::String(format!("<blob {} bytes>", b.len())),
        DuckValue::Date32(days) => DateTime::from_timestamp(i64::from(days) * 86_400, 0)
            .map(|dt| Value::String(dt.date_naive().format("%Y-%m-%d").to_string()))
            .unwrap_or(Value::Null),
        DuckValue::Timestamp(unit, v) => DateTime::from_timestamp_micros(to_micros(unit, v))
            .map(|dt| Value::String(dt.naive_utc().format("%Y-%m-%d %H:%M:%S%.f").to_string()))
            .unwrap_or(Value::Null),
        DuckValue::Time64(unit, v) => Value::String(format_time(to_micros(unit, v))),
        DuckValue::Interval { months, days, nanos } => {
            Value::String(format_interval(months, days, nanos))
        }
        DuckValue::List(items) | DuckValue::Array(items) => {
            Value::Array(items.into_iter().map(value_to_json).collect())
        }
        DuckValue::Struct(fields) => Value::Object(
            fields
                .iter()
                .map(|(name, v)| (name.clone(), value_to_json(v.clone())))
                .collect(),
        ),
        DuckValue::Map(entries) => Value::Object(
            entries
                .iter()
                .map(|(k, v)| (map_key(k.clone()), value_to_json(v.clone())))
                .collect(),
        ),
        DuckValue::Union(inner) => value_to_json(*inner),
    }
}

fn to_micros(unit: TimeUnit, v: i64) -> i64 {
    match unit {
        TimeUnit::Second => v.saturating_mul(1_000_000),
        TimeUnit::Millisecond => v.saturating_mul(1_000),
        TimeUnit::Microsecond => v,
        TimeUnit::Nanosecond => v / 1_000,
    }
}

/// `HH:MM:SS[.ffffff]` from microseconds since midnight
fn format_time(micros: i64) -> String {
    let secs = micros.div_euclid(1_000_000);
    let frac = micros.rem_euclid(1_000_000);
    u32::try_from(secs)
        .ok()
        .and_then(|s| NaiveTime::from_num_seconds_from_midnight_opt(s, (frac * 1_000) as u32))
        .map(|t| t.format("%H:%M:%S%.f").to_string())
        .unwrap_or_else(|| format!("{} us", micros))
}

/// DuckDB-style interval text, e.g. `1 year 2 months 3 days 01:30:00`
fn format_interval(months: i32, days: i32, nanos: i64) -> String {
    let mut parts = Vec::new();
    let (years, months) = (months / 12, months % 12);
    for (n, unit) in [(years, "year"), (months, "month"), (days, "day")] {
        if n != 0 {
            let plural = if n.abs() == 1 { "" } else { "s" };
            parts.push(format!("{} {}{}", n, unit, plural));
        }
    }

    if nanos != 0 || parts.is_empty() {
        let sign = if nanos < 0 { "-" } else { "" };
        let micros = (nanos / 1_000).unsigned_abs();
        let secs = micros / 1_000_000;
        let frac = micros % 1_000_000;
        let (h, m, sec) = (secs / 3600, secs / 60 % 60, secs % 60);
        let mut clock = format!("{}{:02}:{:02}:{:02}", sign, h, m, sec);
        if frac != 0 {
            let digits = format!("{:06}", frac);
            clock.push('.');
            clock.push_str(digits.trim_end_matches('0'));
        }
        parts.push(clock);
    }
    parts.join(" ")
}

fn map_key(key: DuckValue) -> String {
    match value_to_json(key) {
        Value::String(s) => s,
        other => other.to_string(),
    }
}
