//! Schema-less JSON → columnar framer.
//!
//! Each call to [`Framer::to_frame`] turns one message into one row. The
//! column set is cumulative for the lifetime of the framer: a column is
//! created the first time its key is seen, its type is fixed by that first
//! value and it is never removed. Only the buffered values are reset per
//! call.

use std::collections::{HashMap, HashSet};

use base64::Engine;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::message::IngestedMessage;

/// Name of column 0 (receive timestamp).
pub const TIME_COLUMN: &str = "time";
/// Column used when the payload is not a JSON object.
pub const DEFAULT_VALUE_KEY: &str = "Value";
pub const FRAME_NAME: &str = "rabbitmq";

// ═══════════════════════════════════════════════════════════════
//  Options
// ═══════════════════════════════════════════════════════════════

/// How far nested objects are flattened into columns.
///
/// `depth = 1` keeps only the top-level members as columns; any nested
/// object or array becomes a raw JSON column under its key. With a larger
/// depth nested objects are walked and their keys joined with `separator`
/// (`{"a":{"b":1}}` → column `a.b`). Two paths that flatten to the same
/// name in one message keep the first value; the rest are dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlattenOptions {
    pub depth: usize,
    pub separator: String,
}

impl Default for FlattenOptions {
    fn default() -> Self {
        Self {
            depth: 1,
            separator: ".".into(),
        }
    }
}

/// How message payloads are encoded on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PayloadEncoding {
    #[default]
    Json,
    /// JSON wrapped in standard base64.
    Base64Json,
}

#[derive(Debug, thiserror::Error)]
enum PayloadError {
    #[error("base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

// ═══════════════════════════════════════════════════════════════
//  Columns
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Time,
    String,
    Float64,
    Bool,
    /// Opaque JSON (arrays, nested objects).
    Json,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValues {
    Time(Vec<DateTime<Utc>>),
    String(Vec<Option<String>>),
    Float64(Vec<Option<f64>>),
    Bool(Vec<Option<bool>>),
    Json(Vec<Option<Value>>),
}

impl ColumnValues {
    fn nulls(kind: ColumnType, len: usize) -> Self {
        match kind {
            ColumnType::Time => Self::Time(Vec::with_capacity(len)),
            ColumnType::String => Self::String(vec![None; len]),
            ColumnType::Float64 => Self::Float64(vec![None; len]),
            ColumnType::Bool => Self::Bool(vec![None; len]),
            ColumnType::Json => Self::Json(vec![None; len]),
        }
    }

    pub fn kind(&self) -> ColumnType {
        match self {
            Self::Time(_) => ColumnType::Time,
            Self::String(_) => ColumnType::String,
            Self::Float64(_) => ColumnType::Float64,
            Self::Bool(_) => ColumnType::Bool,
            Self::Json(_) => ColumnType::Json,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Time(v) => v.len(),
            Self::String(v) => v.len(),
            Self::Float64(v) => v.len(),
            Self::Bool(v) => v.len(),
            Self::Json(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn clear(&mut self) {
        match self {
            Self::Time(v) => v.clear(),
            Self::String(v) => v.clear(),
            Self::Float64(v) => v.clear(),
            Self::Bool(v) => v.clear(),
            Self::Json(v) => v.clear(),
        }
    }

    fn push_null(&mut self) {
        match self {
            // Time column is filled by the framer itself, never null.
            Self::Time(_) => {}
            Self::String(v) => v.push(None),
            Self::Float64(v) => v.push(None),
            Self::Bool(v) => v.push(None),
            Self::Json(v) => v.push(None),
        }
    }

    /// Append a cell of the matching type. Returns the cell back on mismatch.
    fn push(&mut self, cell: Cell) -> Result<(), Cell> {
        match (self, cell) {
            (Self::String(v), Cell::String(s)) => v.push(Some(s)),
            (Self::Float64(v), Cell::Float64(n)) => v.push(Some(n)),
            (Self::Bool(v), Cell::Bool(b)) => v.push(Some(b)),
            (Self::Json(v), Cell::Json(j)) => v.push(Some(j)),
            (_, cell) => return Err(cell),
        }
        Ok(())
    }

    fn pad_to(&mut self, len: usize) {
        while self.len() < len {
            if matches!(self, Self::Time(_)) {
                break;
            }
            self.push_null();
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    name: String,
    values: ColumnValues,
}

impl Column {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ColumnType {
        self.values.kind()
    }

    pub fn values(&self) -> &ColumnValues {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// One framed message: every column known so far, each holding one row.
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    pub name: String,
    pub columns: Vec<Column>,
}

impl Table {
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn rows(&self) -> usize {
        self.columns.first().map(Column::len).unwrap_or(0)
    }
}

/// A single non-null JSON value headed for a column.
#[derive(Debug, Clone, PartialEq)]
enum Cell {
    String(String),
    Float64(f64),
    Bool(bool),
    Json(Value),
}

impl Cell {
    /// `None` for JSON null.
    fn from_json(value: Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::String(s) => Some(Self::String(s)),
            Value::Bool(b) => Some(Self::Bool(b)),
            Value::Number(n) => Some(n.as_f64().map_or(Self::Json(Value::Number(n)), Self::Float64)),
            other @ (Value::Array(_) | Value::Object(_)) => Some(Self::Json(other)),
        }
    }

    fn kind(&self) -> ColumnType {
        match self {
            Self::String(_) => ColumnType::String,
            Self::Float64(_) => ColumnType::Float64,
            Self::Bool(_) => ColumnType::Bool,
            Self::Json(_) => ColumnType::Json,
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  Framer
// ═══════════════════════════════════════════════════════════════

pub struct Framer {
    options: FlattenOptions,
    encoding: PayloadEncoding,
    columns: Vec<Column>,
    index: HashMap<String, usize>,
    /// Columns that already received a value during the current call.
    written: HashSet<usize>,
}

impl Framer {
    pub fn new(options: FlattenOptions) -> Self {
        let time = Column {
            name: TIME_COLUMN.to_string(),
            values: ColumnValues::Time(Vec::new()),
        };
        Self {
            options,
            encoding: PayloadEncoding::default(),
            columns: vec![time],
            index: HashMap::from([(TIME_COLUMN.to_string(), 0)]),
            written: HashSet::new(),
        }
    }

    pub fn with_encoding(mut self, encoding: PayloadEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    /// Column definitions accumulated so far, in creation order.
    pub fn schema(&self) -> Vec<(&str, ColumnType)> {
        self.columns.iter().map(|c| (c.name(), c.kind())).collect()
    }

    /// Frame one message into a single-row table.
    ///
    /// A payload that fails to decode still yields a row: the timestamp is
    /// set and every other column is null.
    pub fn to_frame(&mut self, message: &IngestedMessage) -> Table {
        for column in &mut self.columns {
            column.values.clear();
        }
        self.written.clear();

        match self.decode(&message.payload) {
            Ok(value) => self.ingest(value),
            Err(e) => tracing::warn!(error = %e, "error parsing message"),
        }

        if let ColumnValues::Time(times) = &mut self.columns[0].values {
            times.push(message.received_at);
        }
        let rows = self.columns[0].len();
        for column in &mut self.columns {
            column.values.pad_to(rows);
        }

        Table {
            name: FRAME_NAME.to_string(),
            columns: self.columns.clone(),
        }
    }

    fn decode(&self, payload: &[u8]) -> Result<Value, PayloadError> {
        match self.encoding {
            PayloadEncoding::Json => Ok(serde_json::from_slice(payload)?),
            PayloadEncoding::Base64Json => {
                let trimmed = payload.trim_ascii();
                let bytes = base64::engine::general_purpose::STANDARD.decode(trimmed)?;
                Ok(serde_json::from_slice(&bytes)?)
            }
        }
    }

    fn ingest(&mut self, value: Value) {
        match value {
            Value::Object(members) => self.walk(members, None, 1),
            Value::Null => self.add_null(DEFAULT_VALUE_KEY),
            other => {
                if let Some(cell) = Cell::from_json(other) {
                    self.add_value(DEFAULT_VALUE_KEY, cell);
                }
            }
        }
    }

    fn walk(&mut self, members: Map<String, Value>, prefix: Option<&str>, level: usize) {
        for (key, value) in members {
            let name = match prefix {
                Some(p) => format!("{p}{}{key}", self.options.separator),
                None => key,
            };
            match value {
                Value::Object(inner) if level < self.options.depth => {
                    self.walk(inner, Some(&name), level + 1);
                }
                Value::Null => self.add_null(&name),
                other => {
                    if let Some(cell) = Cell::from_json(other) {
                        self.add_value(&name, cell);
                    }
                }
            }
        }
    }

    fn add_null(&mut self, name: &str) {
        let Some(&idx) = self.index.get(name) else {
            tracing::info!(key = %name, "nil value for unknown field");
            return;
        };
        if !self.written.insert(idx) {
            tracing::warn!(key = %name, "duplicate flattened key in message, keeping first value");
            return;
        }
        self.columns[idx].values.push_null();
    }

    fn add_value(&mut self, name: &str, cell: Cell) {
        if let Some(&idx) = self.index.get(name) {
            if !self.written.insert(idx) {
                tracing::warn!(key = %name, "duplicate flattened key in message, keeping first value");
                return;
            }
            let column = &mut self.columns[idx];
            if let Err(cell) = column.values.push(cell) {
                tracing::warn!(
                    key = %name,
                    existing = ?column.kind(),
                    new = ?cell.kind(),
                    "field type mismatch, value dropped"
                );
            }
            return;
        }

        let rows = self.columns[0].len();
        let mut values = ColumnValues::nulls(cell.kind(), rows);
        // Freshly created column always matches the cell kind.
        let _ = values.push(cell);
        let idx = self.columns.len();
        self.columns.push(Column {
            name: name.to_string(),
            values,
        });
        self.index.insert(name.to_string(), idx);
        self.written.insert(idx);
    }
}

impl Default for Framer {
    fn default() -> Self {
        Self::new(FlattenOptions::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn msg(secs: i64, payload: &str) -> IngestedMessage {
        IngestedMessage::at(Utc.timestamp_opt(secs, 0).unwrap(), payload.as_bytes().to_vec())
    }

    fn floats(table: &Table, name: &str) -> Vec<Option<f64>> {
        match table.column(name).unwrap().values() {
            ColumnValues::Float64(v) => v.clone(),
            other => panic!("{name} is {:?}", other.kind()),
        }
    }

    fn strings(table: &Table, name: &str) -> Vec<Option<String>> {
        match table.column(name).unwrap().values() {
            ColumnValues::String(v) => v.clone(),
            other => panic!("{name} is {:?}", other.kind()),
        }
    }

    fn assert_rectangular(table: &Table) {
        let rows = table.rows();
        assert_eq!(rows, 1);
        for c in &table.columns {
            assert_eq!(c.len(), rows, "column {} is ragged", c.name());
        }
    }

    #[test]
    fn test_publisher_payload() {
        let mut framer = Framer::default();
        let table = framer.to_frame(&msg(10, r#"{"name":"demo.publisher","value":4213}"#));

        assert_eq!(table.name, FRAME_NAME);
        assert_eq!(table.column_names(), vec!["time", "name", "value"]);
        match table.columns[0].values() {
            ColumnValues::Time(t) => assert_eq!(t, &vec![Utc.timestamp_opt(10, 0).unwrap()]),
            other => panic!("time column is {:?}", other.kind()),
        }
        assert_eq!(strings(&table, "name"), vec![Some("demo.publisher".to_string())]);
        assert_eq!(floats(&table, "value"), vec![Some(4213.0)]);
        assert_rectangular(&table);
    }

    #[test]
    fn test_type_mismatch_is_dropped() {
        let mut framer = Framer::default();
        framer.to_frame(&msg(1, r#"{"name":"demo.publisher","value":4213}"#));
        let table = framer.to_frame(&msg(2, r#"{"value":"oops"}"#));

        assert_eq!(table.column_names(), vec!["time", "name", "value"]);
        assert_eq!(table.column("value").unwrap().kind(), ColumnType::Float64);
        assert_eq!(floats(&table, "value"), vec![None]);
        assert_eq!(strings(&table, "name"), vec![None]);
        assert_rectangular(&table);
    }

    #[test]
    fn test_nested_object_is_one_json_column() {
        let mut framer = Framer::default();
        let table = framer.to_frame(&msg(1, r#"{"nested":{"a":1}}"#));

        assert_eq!(table.column_names(), vec!["time", "nested"]);
        let nested = table.column("nested").unwrap();
        assert_eq!(nested.kind(), ColumnType::Json);
        assert_eq!(nested.values(), &ColumnValues::Json(vec![Some(json!({"a": 1}))]));
    }

    #[test]
    fn test_array_member_is_json_column() {
        let mut framer = Framer::default();
        let table = framer.to_frame(&msg(1, r#"{"tags":["a","b"],"ok":true}"#));

        assert_eq!(table.column("tags").unwrap().values(), &ColumnValues::Json(vec![Some(json!(["a", "b"]))]));
        assert_eq!(table.column("ok").unwrap().values(), &ColumnValues::Bool(vec![Some(true)]));
    }

    #[test]
    fn test_non_object_payload_uses_value_column() {
        let mut framer = Framer::default();
        let table = framer.to_frame(&msg(1, "42"));
        assert_eq!(floats(&table, DEFAULT_VALUE_KEY), vec![Some(42.0)]);

        let table = framer.to_frame(&msg(2, "[1,2]"));
        // Value column is Float64 now; an array is a type mismatch.
        assert_eq!(floats(&table, DEFAULT_VALUE_KEY), vec![None]);
        assert_rectangular(&table);
    }

    #[test]
    fn test_top_level_array_creates_json_value_column() {
        let mut framer = Framer::default();
        let table = framer.to_frame(&msg(1, r#"[{"a":1}]"#));
        assert_eq!(
            table.column(DEFAULT_VALUE_KEY).unwrap().values(),
            &ColumnValues::Json(vec![Some(json!([{"a": 1}]))])
        );
    }

    #[test]
    fn test_null_for_unknown_key_creates_no_column() {
        let mut framer = Framer::default();
        let table = framer.to_frame(&msg(1, r#"{"ghost":null,"x":1}"#));
        assert_eq!(table.column_names(), vec!["time", "x"]);
    }

    #[test]
    fn test_null_for_known_key_is_null_slot() {
        let mut framer = Framer::default();
        framer.to_frame(&msg(1, r#"{"x":1}"#));
        let table = framer.to_frame(&msg(2, r#"{"x":null}"#));
        assert_eq!(floats(&table, "x"), vec![None]);
        assert_rectangular(&table);
    }

    #[test]
    fn test_schema_is_monotonic() {
        let mut framer = Framer::default();
        let payloads = [
            r#"{"a":1}"#,
            r#"{"b":"x"}"#,
            r#"not json"#,
            r#"{"a":"wrong","c":false}"#,
            r#"{}"#,
            r#"{"d":{"deep":true}}"#,
        ];
        let mut previous: Vec<String> = Vec::new();
        for (i, p) in payloads.iter().enumerate() {
            let table = framer.to_frame(&msg(i as i64, p));
            let names: Vec<String> = table.column_names().iter().map(|s| s.to_string()).collect();
            for name in &previous {
                assert!(names.contains(name), "column {name} disappeared after message {i}");
            }
            assert_rectangular(&table);
            previous = names;
        }
        assert_eq!(previous, vec!["time", "a", "b", "c", "d"]);
    }

    #[test]
    fn test_type_is_fixed_by_first_value() {
        let mut framer = Framer::default();
        framer.to_frame(&msg(1, r#"{"flag":true}"#));
        for p in [r#"{"flag":"yes"}"#, r#"{"flag":1}"#, r#"{"flag":[true]}"#] {
            let table = framer.to_frame(&msg(2, p));
            assert_eq!(table.column("flag").unwrap().values(), &ColumnValues::Bool(vec![None]));
        }
        assert_eq!(framer.schema(), vec![("time", ColumnType::Time), ("flag", ColumnType::Bool)]);
    }

    #[test]
    fn test_key_named_time_cannot_override_timestamp() {
        let mut framer = Framer::default();
        let table = framer.to_frame(&msg(7, r#"{"time":"yesterday"}"#));
        assert_eq!(table.column_names(), vec!["time"]);
        assert_eq!(table.columns[0].kind(), ColumnType::Time);
        assert_rectangular(&table);
    }

    #[test]
    fn test_invalid_json_still_emits_timestamp_row() {
        let mut framer = Framer::default();
        framer.to_frame(&msg(1, r#"{"x":1}"#));
        let table = framer.to_frame(&msg(2, "{broken"));
        assert_eq!(floats(&table, "x"), vec![None]);
        assert_rectangular(&table);
    }

    #[test]
    fn test_base64_payload() {
        let mut framer = Framer::default().with_encoding(PayloadEncoding::Base64Json);
        let encoded = base64::engine::general_purpose::STANDARD.encode(r#"{"v":3}"#);
        let table = framer.to_frame(&msg(1, &encoded));
        assert_eq!(floats(&table, "v"), vec![Some(3.0)]);

        let table = framer.to_frame(&msg(2, "%%%not-base64"));
        assert_eq!(floats(&table, "v"), vec![None]);
    }

    #[test]
    fn test_deep_flatten_uses_separator() {
        let mut framer = Framer::new(FlattenOptions { depth: 2, separator: ".".into() });
        let table = framer.to_frame(&msg(1, r#"{"a":{"b":1,"c":{"d":2}},"ab":3}"#));

        assert_eq!(table.column_names(), vec!["time", "a.b", "a.c", "ab"]);
        assert_eq!(floats(&table, "a.b"), vec![Some(1.0)]);
        assert_eq!(floats(&table, "ab"), vec![Some(3.0)]);
        assert_eq!(table.column("a.c").unwrap().kind(), ColumnType::Json);
    }

    #[test]
    fn test_flatten_collision_keeps_first_value() {
        let mut framer = Framer::new(FlattenOptions { depth: 2, separator: ".".into() });
        let table = framer.to_frame(&msg(1, r#"{"a":{"b":1},"a.b":2}"#));

        assert_eq!(table.column_names(), vec!["time", "a.b"]);
        assert_eq!(floats(&table, "a.b"), vec![Some(1.0)]);
        assert_rectangular(&table);
    }

    #[test]
    fn test_members_keep_document_order() {
        let mut framer = Framer::default();
        let table = framer.to_frame(&msg(1, r#"{"z":1,"a":2,"m":3}"#));
        assert_eq!(table.column_names(), vec!["time", "z", "a", "m"]);
    }
}
