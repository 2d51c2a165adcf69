use grafana_plugin_sdk::data::Frame;
use grafana_plugin_sdk::prelude::*;
use stream_bridge::{ColumnValues, Table};

// ═══════════════════════════════════════════════════════════════
//  Table → Grafana frame
// ═══════════════════════════════════════════════════════════════

/// Render one framed message as a Grafana data frame.
///
/// Column order is preserved; every column but `time` is nullable.
pub(crate) fn table_to_frame(table: &Table) -> Frame {
    let mut frame = Frame::new(table.name.as_str());
    for column in &table.columns {
        let name = column.name();
        frame = match column.values() {
            ColumnValues::Time(v) => frame.with_field(v.clone().into_field(name)),
            ColumnValues::String(v) => frame.with_field(v.clone().into_opt_field(name)),
            ColumnValues::Float64(v) => frame.with_field(v.clone().into_opt_field(name)),
            ColumnValues::Bool(v) => frame.with_field(v.clone().into_opt_field(name)),
            ColumnValues::Json(v) => frame.with_field(json_cells(v).into_opt_field(name)),
        };
    }
    frame
}

/// Raw JSON blobs travel as compact JSON text.
fn json_cells(values: &[Option<serde_json::Value>]) -> Vec<Option<String>> {
    values
        .iter()
        .map(|v| v.as_ref().map(serde_json::Value::to_string))
        .collect()
}
