//! Terminal rendering of query results using comfy-table.

use askdata_duck::QueryResult;
use comfy_table::{presets::UTF8_FULL_CONDENSED, Attribute, Cell, ContentArrangement, Table};
use serde_json::Value;

pub fn format_value(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Scalars print bare; everything else as a table of at most `max_rows` rows.
pub fn render_result(result: &QueryResult, max_rows: usize) -> String {
    if let Some(value) = result.scalar() {
        return format_value(value);
    }
    if result.is_empty() {
        return format!("(no rows) columns: {}", result.columns.join(", "));
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(
            result
                .columns
                .iter()
                .map(|c| Cell::new(c).add_attribute(Attribute::Bold)),
        );

    for row in result.rows.iter().take(max_rows) {
        table.add_row(row.iter().map(format_value));
    }

    let mut out = table.to_string();
    let hidden = result.row_count().saturating_sub(max_rows);
    if hidden > 0 {
        out.push_str(&format!("\n... {} more rows ({} total)", hidden, result.row_count()));
    }
    out
}
