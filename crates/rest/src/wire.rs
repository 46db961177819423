//! REST wire representation: `{"f": [{"v": ...}]}` rows, response envelopes and the
//! structured error body, plus decoding of wire rows into typed [`Row`]s.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rowstream_common::{
    ApiError, FieldMode, FieldSchema, FieldType, Result, Row, RowStreamError, Schema, TableRef,
    Value,
};
use serde::{Deserialize, Deserializer, Serialize};

/// One wire row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableRow {
    #[serde(default)]
    pub f: Vec<TableCell>,
}

/// One wire cell: a string, null, a nested row object, or a list of cells.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableCell {
    #[serde(default)]
    pub v: serde_json::Value,
}

impl TableRow {
    /// Build a row of scalar string cells (test/fixture helper).
    pub fn from_strings<I, S>(cells: I) -> Self
    where
        I: IntoIterator<Item = Option<S>>,
        S: Into<String>,
    {
        Self {
            f: cells
                .into_iter()
                .map(|c| TableCell {
                    v: c.map_or(serde_json::Value::Null, |s| {
                        serde_json::Value::String(s.into())
                    }),
                })
                .collect(),
        }
    }
}

/// `tabledata.list` response.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableDataList {
    #[serde(default)]
    pub rows: Vec<TableRow>,
    #[serde(default)]
    pub page_token: Option<String>,
    #[serde(default, deserialize_with = "de_u64")]
    pub total_rows: u64,
}

/// `jobs.getQueryResults` response (possibly field-projected).
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResults {
    #[serde(default)]
    pub schema: Option<Schema>,
    #[serde(default)]
    pub rows: Vec<TableRow>,
    #[serde(default)]
    pub page_token: Option<String>,
    #[serde(default, deserialize_with = "de_u64")]
    pub total_rows: u64,
    /// Absent when projected away; `Some(false)` means the job is still running.
    #[serde(default)]
    pub job_complete: Option<bool>,
}

/// `tables.get` response subset.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableMetadata {
    #[serde(default)]
    pub schema: Schema,
    #[serde(default, deserialize_with = "de_u64")]
    pub num_rows: u64,
}

/// `jobs.get` response subset.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResource {
    #[serde(default)]
    pub configuration: Option<JobConfiguration>,
    #[serde(default)]
    pub status: Option<JobStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobConfiguration {
    #[serde(default)]
    pub query: Option<QueryJobConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryJobConfig {
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub destination_table: Option<TableRef>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct JobStatus {
    #[serde(default)]
    pub state: String,
}

/// `{"error": {...}}` body of a non-2xx response.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub code: u16,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub errors: Vec<ErrorItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ErrorItem {
    #[serde(default)]
    pub reason: String,
}

impl ErrorEnvelope {
    pub fn into_api_error(self, status: u16) -> ApiError {
        let code = if self.error.code == 0 {
            status
        } else {
            self.error.code
        };
        ApiError {
            code,
            reason: self
                .error
                .errors
                .into_iter()
                .map(|e| e.reason)
                .find(|r| !r.is_empty()),
            message: self.error.message,
        }
    }
}

// int64 fields are JSON strings on the wire; accept numbers too.
fn de_u64<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(u64),
        Str(String),
        Null,
    }
    match Raw::deserialize(deserializer)? {
        Raw::Num(n) => Ok(n),
        Raw::Str(s) => s.parse::<u64>().map_err(serde::de::Error::custom),
        Raw::Null => Ok(0),
    }
}

/// Decode wire rows into typed rows aligned with `schema`.
///
/// # Errors
/// Returns [`RowStreamError::Decode`] when a row's width or a cell's shape does not
/// match the schema.
pub fn decode_rest_rows(rows: &[TableRow], schema: &Schema) -> Result<Vec<Row>> {
    rows.iter()
        .map(|row| decode_record(&row.f, &schema.fields))
        .collect()
}

fn decode_record(cells: &[TableCell], fields: &[FieldSchema]) -> Result<Row> {
    if cells.len() != fields.len() {
        return Err(RowStreamError::Decode(format!(
            "row has {} cells but schema has {} fields",
            cells.len(),
            fields.len()
        )));
    }
    cells
        .iter()
        .zip(fields)
        .map(|(cell, field)| decode_cell(&cell.v, field))
        .collect()
}

fn decode_cell(v: &serde_json::Value, field: &FieldSchema) -> Result<Value> {
    if field.mode != FieldMode::Repeated {
        return decode_single(v, field);
    }
    match v {
        serde_json::Value::Null => Ok(Value::Array(Vec::new())),
        serde_json::Value::Array(items) => items
            .iter()
            .map(|item| {
                let inner = item.get("v").unwrap_or(&serde_json::Value::Null);
                decode_single(inner, field)
            })
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        other => Err(RowStreamError::Decode(format!(
            "repeated field '{}' expects a list, got {other}",
            field.name
        ))),
    }
}

fn decode_single(v: &serde_json::Value, field: &FieldSchema) -> Result<Value> {
    match (v, field.field_type) {
        (serde_json::Value::Null, _) => Ok(Value::Null),
        (serde_json::Value::Object(obj), FieldType::Record) => {
            let cells = obj
                .get("f")
                .cloned()
                .map(serde_json::from_value::<Vec<TableCell>>)
                .transpose()
                .map_err(|e| RowStreamError::Decode(format!("record '{}': {e}", field.name)))?
                .unwrap_or_default();
            decode_record(&cells, &field.fields).map(Value::Struct)
        }
        (serde_json::Value::String(s), ty) if ty != FieldType::Record => parse_basic(s, ty)
            .map_err(|e| RowStreamError::Decode(format!("field '{}': {e}", field.name))),
        (other, ty) => Err(RowStreamError::Decode(format!(
            "field '{}' of type {ty:?} cannot hold {other}",
            field.name
        ))),
    }
}

fn parse_basic(s: &str, ty: FieldType) -> std::result::Result<Value, String> {
    let value = match ty {
        FieldType::String
        | FieldType::Geography
        | FieldType::Json
        | FieldType::Interval
        | FieldType::Unknown => Value::String(s.to_string()),
        FieldType::Bytes => Value::Bytes(STANDARD.decode(s).map_err(|e| e.to_string())?),
        FieldType::Integer => Value::Int64(s.parse::<i64>().map_err(|e| e.to_string())?),
        FieldType::Float => Value::Float64(s.parse::<f64>().map_err(|e| e.to_string())?),
        FieldType::Boolean => match s.to_ascii_lowercase().as_str() {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => return Err(format!("invalid boolean '{s}'")),
        },
        FieldType::Numeric | FieldType::BigNumeric => Value::Numeric(s.to_string()),
        FieldType::Timestamp => Value::Timestamp(parse_timestamp(s)?),
        FieldType::Date => Value::Date(
            NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|e| e.to_string())?,
        ),
        FieldType::Time => Value::Time(
            NaiveTime::parse_from_str(s, "%H:%M:%S%.f").map_err(|e| e.to_string())?,
        ),
        FieldType::Datetime => Value::DateTime(
            NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
                .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f"))
                .map_err(|e| e.to_string())?,
        ),
        FieldType::Record => return Err("record value must be an object".to_string()),
    };
    Ok(value)
}

// Float seconds since the epoch, e.g. "1.7041536E9".
fn parse_timestamp(s: &str) -> std::result::Result<DateTime<Utc>, String> {
    let secs = s.parse::<f64>().map_err(|e| e.to_string())?;
    let micros = (secs * 1_000_000.0).round() as i64;
    DateTime::from_timestamp_micros(micros).ok_or_else(|| format!("timestamp out of range: {s}"))
}
