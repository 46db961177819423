//! Arrow IPC decoding of storage read payloads into [`Row`]s.
//!
//! Streams deliver the schema once (session) and bare record batch messages
//! afterwards; each payload is decoded by replaying it behind the schema message.

use std::io::Cursor;

use arrow::array::{Array, AsArray, RecordBatch};
use arrow::datatypes::{
    DataType, Date32Type, Date64Type, Decimal128Type, Decimal256Type, Float16Type, Float32Type,
    Float64Type, Int8Type, Int16Type, Int32Type, Int64Type, Time32MillisecondType,
    Time32SecondType, Time64MicrosecondType, Time64NanosecondType, TimeUnit,
    TimestampMicrosecondType, TimestampMillisecondType, TimestampNanosecondType,
    TimestampSecondType, UInt8Type, UInt16Type, UInt32Type, UInt64Type,
};
use arrow::ipc::reader::StreamReader as IpcStreamReader;
use arrow_schema::{Field, SchemaRef};
use bytes::Bytes;
use rowstream_common::{
    FieldMode, FieldSchema, FieldType, Result, Row, RowStreamError, Schema, Value,
};

/// Decoder bound to one session's Arrow schema.
#[derive(Debug, Clone)]
pub struct ArrowDecoder {
    serialized_schema: Bytes,
    arrow_schema: SchemaRef,
    schema: Schema,
}

impl ArrowDecoder {
    /// Parse `serialized_schema`. `schema` is the table schema reported to callers;
    /// when empty it is derived from the Arrow fields.
    ///
    /// # Errors
    /// Fails on a malformed schema message or a column count mismatch.
    pub fn try_new(serialized_schema: Bytes, schema: Schema) -> Result<Self> {
        let reader = IpcStreamReader::try_new(Cursor::new(serialized_schema.clone()), None)
            .map_err(|e| RowStreamError::Decode(format!("arrow schema decode failed: {e}")))?;
        let arrow_schema = reader.schema();
        let schema = if schema.is_empty() {
            Schema::new(arrow_schema.fields().iter().map(|f| field_schema(f)).collect())
        } else {
            schema
        };
        if schema.len() != arrow_schema.fields().len() {
            return Err(RowStreamError::Decode(format!(
                "schema has {} fields but arrow schema has {}",
                schema.len(),
                arrow_schema.fields().len()
            )));
        }
        Ok(Self {
            serialized_schema,
            arrow_schema,
            schema,
        })
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn arrow_schema(&self) -> &SchemaRef {
        &self.arrow_schema
    }

    /// Decode one payload into zero or more record batches.
    ///
    /// # Errors
    /// Fails on malformed IPC data.
    pub fn decode(&self, serialized_batch: &[u8]) -> Result<DecodedBatch> {
        let mut buf = Vec::with_capacity(self.serialized_schema.len() + serialized_batch.len());
        buf.extend_from_slice(&self.serialized_schema);
        buf.extend_from_slice(serialized_batch);
        let reader = IpcStreamReader::try_new(Cursor::new(buf), None)
            .map_err(|e| RowStreamError::Decode(format!("ipc reader init failed: {e}")))?;
        let batches = reader
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| RowStreamError::Decode(format!("ipc read failed: {e}")))?;
        Ok(DecodedBatch { batches })
    }
}

/// Record batches decoded from one payload. Buffers are released when this is dropped
/// or consumed, whichever path is taken.
#[derive(Debug)]
pub struct DecodedBatch {
    batches: Vec<RecordBatch>,
}

impl DecodedBatch {
    pub fn num_rows(&self) -> usize {
        self.batches.iter().map(RecordBatch::num_rows).sum()
    }

    pub fn batches(&self) -> &[RecordBatch] {
        &self.batches
    }

    /// Extract rows, releasing the Arrow buffers.
    ///
    /// # Errors
    /// Fails on a column type with no [`Value`] mapping.
    pub fn into_rows(self) -> Result<Vec<Row>> {
        let mut rows = Vec::with_capacity(self.num_rows());
        for batch in &self.batches {
            for i in 0..batch.num_rows() {
                let row = batch
                    .columns()
                    .iter()
                    .map(|col| arrow_value(col.as_ref(), i))
                    .collect::<Result<Row>>()?;
                rows.push(row);
            }
        }
        Ok(rows)
    }
}

fn field_schema(field: &Field) -> FieldSchema {
    let (field_type, repeated, children) = match field.data_type() {
        DataType::List(inner) | DataType::LargeList(inner) => {
            let inner = field_schema(inner);
            (inner.field_type, true, inner.fields)
        }
        DataType::Struct(fields) => (
            FieldType::Record,
            false,
            fields.iter().map(|f| field_schema(f)).collect(),
        ),
        other => (field_type(other), false, Vec::new()),
    };
    let mode = if repeated {
        FieldMode::Repeated
    } else if field.is_nullable() {
        FieldMode::Nullable
    } else {
        FieldMode::Required
    };
    FieldSchema {
        name: field.name().clone(),
        field_type,
        mode,
        fields: children,
    }
}

fn field_type(dt: &DataType) -> FieldType {
    match dt {
        DataType::Boolean => FieldType::Boolean,
        DataType::Int8
        | DataType::Int16
        | DataType::Int32
        | DataType::Int64
        | DataType::UInt8
        | DataType::UInt16
        | DataType::UInt32
        | DataType::UInt64 => FieldType::Integer,
        DataType::Float16 | DataType::Float32 | DataType::Float64 => FieldType::Float,
        DataType::Utf8 | DataType::LargeUtf8 => FieldType::String,
        DataType::Binary | DataType::LargeBinary => FieldType::Bytes,
        DataType::Date32 | DataType::Date64 => FieldType::Date,
        DataType::Time32(_) | DataType::Time64(_) => FieldType::Time,
        DataType::Timestamp(_, Some(_)) => FieldType::Timestamp,
        DataType::Timestamp(_, None) => FieldType::Datetime,
        DataType::Decimal128(_, _) => FieldType::Numeric,
        DataType::Decimal256(_, _) => FieldType::BigNumeric,
        DataType::Struct(_) => FieldType::Record,
        _ => FieldType::Unknown,
    }
}

fn out_of_range(dt: &DataType) -> RowStreamError {
    RowStreamError::Decode(format!("{dt} value out of range"))
}

/// Convert one Arrow cell to a [`Value`].
pub fn arrow_value(array: &dyn Array, row: usize) -> Result<Value> {
    if array.is_null(row) {
        return Ok(Value::Null);
    }
    let dt = array.data_type();
    let value = match dt {
        DataType::Null => Value::Null,
        DataType::Boolean => Value::Bool(array.as_boolean().value(row)),
        DataType::Int8 => Value::Int64(array.as_primitive::<Int8Type>().value(row).into()),
        DataType::Int16 => Value::Int64(array.as_primitive::<Int16Type>().value(row).into()),
        DataType::Int32 => Value::Int64(array.as_primitive::<Int32Type>().value(row).into()),
        DataType::Int64 => Value::Int64(array.as_primitive::<Int64Type>().value(row)),
        DataType::UInt8 => Value::Int64(array.as_primitive::<UInt8Type>().value(row).into()),
        DataType::UInt16 => Value::Int64(array.as_primitive::<UInt16Type>().value(row).into()),
        DataType::UInt32 => Value::Int64(array.as_primitive::<UInt32Type>().value(row).into()),
        DataType::UInt64 => Value::Int64(
            i64::try_from(array.as_primitive::<UInt64Type>().value(row))
                .map_err(|_| out_of_range(dt))?,
        ),
        DataType::Float16 => {
            Value::Float64(array.as_primitive::<Float16Type>().value(row).to_f64())
        }
        DataType::Float32 => Value::Float64(array.as_primitive::<Float32Type>().value(row).into()),
        DataType::Float64 => Value::Float64(array.as_primitive::<Float64Type>().value(row)),
        DataType::Utf8 => Value::String(array.as_string::<i32>().value(row).to_string()),
        DataType::LargeUtf8 => Value::String(array.as_string::<i64>().value(row).to_string()),
        DataType::Binary => Value::Bytes(array.as_binary::<i32>().value(row).to_vec()),
        DataType::LargeBinary => Value::Bytes(array.as_binary::<i64>().value(row).to_vec()),
        DataType::Date32 => Value::Date(
            array
                .as_primitive::<Date32Type>()
                .value_as_date(row)
                .ok_or_else(|| out_of_range(dt))?,
        ),
        DataType::Date64 => Value::Date(
            array
                .as_primitive::<Date64Type>()
                .value_as_date(row)
                .ok_or_else(|| out_of_range(dt))?,
        ),
        DataType::Time32(unit) => {
            let t = match unit {
                TimeUnit::Second => array.as_primitive::<Time32SecondType>().value_as_time(row),
                _ => array
                    .as_primitive::<Time32MillisecondType>()
                    .value_as_time(row),
            };
            Value::Time(t.ok_or_else(|| out_of_range(dt))?)
        }
        DataType::Time64(unit) => {
            let t = match unit {
                TimeUnit::Nanosecond => array
                    .as_primitive::<Time64NanosecondType>()
                    .value_as_time(row),
                _ => array
                    .as_primitive::<Time64MicrosecondType>()
                    .value_as_time(row),
            };
            Value::Time(t.ok_or_else(|| out_of_range(dt))?)
        }
        DataType::Timestamp(unit, tz) => {
            let naive = match unit {
                TimeUnit::Second => array
                    .as_primitive::<TimestampSecondType>()
                    .value_as_datetime(row),
                TimeUnit::Millisecond => array
                    .as_primitive::<TimestampMillisecondType>()
                    .value_as_datetime(row),
                TimeUnit::Microsecond => array
                    .as_primitive::<TimestampMicrosecondType>()
                    .value_as_datetime(row),
                TimeUnit::Nanosecond => array
                    .as_primitive::<TimestampNanosecondType>()
                    .value_as_datetime(row),
            }
            .ok_or_else(|| out_of_range(dt))?;
            match tz {
                Some(_) => Value::Timestamp(naive.and_utc()),
                None => Value::DateTime(naive),
            }
        }
        DataType::Decimal128(_, _) => {
            Value::Numeric(array.as_primitive::<Decimal128Type>().value_as_string(row))
        }
        DataType::Decimal256(_, _) => {
            Value::Numeric(array.as_primitive::<Decimal256Type>().value_as_string(row))
        }
        DataType::List(_) => list_value(array.as_list::<i32>().value(row).as_ref())?,
        DataType::LargeList(_) => list_value(array.as_list::<i64>().value(row).as_ref())?,
        DataType::Struct(_) => Value::Struct(
            array
                .as_struct()
                .columns()
                .iter()
                .map(|col| arrow_value(col.as_ref(), row))
                .collect::<Result<_>>()?,
        ),
        other => {
            return Err(RowStreamError::Unsupported(format!(
                "arrow type {other} has no value mapping"
            )));
        }
    };
    Ok(value)
}

fn list_value(values: &dyn Array) -> Result<Value> {
    (0..values.len())
        .map(|i| arrow_value(values, i))
        .collect::<Result<Vec<_>>>()
        .map(Value::Array)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow::array::{
        ArrayRef, BooleanArray, Int64Array, ListBuilder, StringArray, StringBuilder,
        TimestampMicrosecondArray,
    };
    use arrow::ipc::writer::StreamWriter;
    use arrow_schema::{Field, Schema as ArrowSchema};
    use chrono::DateTime;

    use super::*;

    fn encode(batch: &RecordBatch) -> (Bytes, Bytes) {
        let mut writer = StreamWriter::try_new(Vec::new(), &batch.schema()).unwrap();
        let schema_len = writer.get_ref().len();
        writer.write(batch).unwrap();
        let buf = writer.into_inner().unwrap();
        (
            Bytes::copy_from_slice(&buf[..schema_len]),
            Bytes::copy_from_slice(&buf[schema_len..]),
        )
    }

    fn sample_batch() -> RecordBatch {
        let mut tags = ListBuilder::new(StringBuilder::new());
        tags.values().append_value("x");
        tags.values().append_value("y");
        tags.append(true);
        tags.append(true);
        let schema = ArrowSchema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("name", DataType::Utf8, true),
            Field::new("ok", DataType::Boolean, true),
            Field::new(
                "ts",
                DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
                true,
            ),
            Field::new(
                "tags",
                DataType::List(Arc::new(Field::new("item", DataType::Utf8, true))),
                true,
            ),
        ]);
        let columns: Vec<ArrayRef> = vec![
            Arc::new(Int64Array::from(vec![1, 2])),
            Arc::new(StringArray::from(vec![Some("a"), None])),
            Arc::new(BooleanArray::from(vec![true, false])),
            Arc::new(
                TimestampMicrosecondArray::from(vec![1_700_000_000_000_000, 0])
                    .with_timezone("UTC"),
            ),
            Arc::new(tags.finish()),
        ];
        RecordBatch::try_new(Arc::new(schema), columns).unwrap()
    }

    #[test]
    fn decodes_batch_payload_into_rows() {
        let (schema_bytes, batch_bytes) = encode(&sample_batch());
        let decoder = ArrowDecoder::try_new(schema_bytes, Schema::default()).unwrap();
        let decoded = decoder.decode(&batch_bytes).unwrap();
        assert_eq!(decoded.num_rows(), 2);

        let rows = decoded.into_rows().unwrap();
        assert_eq!(rows[0][0], Value::Int64(1));
        assert_eq!(rows[0][1], Value::String("a".to_string()));
        assert_eq!(rows[1][1], Value::Null);
        assert_eq!(rows[1][2], Value::Bool(false));
        assert_eq!(
            rows[0][3],
            Value::Timestamp(DateTime::from_timestamp_micros(1_700_000_000_000_000).unwrap())
        );
        assert_eq!(
            rows[0][4],
            Value::Array(vec![
                Value::String("x".to_string()),
                Value::String("y".to_string())
            ])
        );
        assert_eq!(rows[1][4], Value::Array(vec![]));
    }

    #[test]
    fn derives_schema_from_arrow_fields() {
        let (schema_bytes, _) = encode(&sample_batch());
        let decoder = ArrowDecoder::try_new(schema_bytes, Schema::default()).unwrap();
        let schema = decoder.schema();
        assert_eq!(schema.len(), 5);
        assert_eq!(schema.fields[0].field_type, FieldType::Integer);
        assert_eq!(schema.fields[0].mode, FieldMode::Required);
        assert_eq!(schema.fields[3].field_type, FieldType::Timestamp);
        assert_eq!(schema.fields[4].field_type, FieldType::String);
        assert_eq!(schema.fields[4].mode, FieldMode::Repeated);
    }

    #[test]
    fn rejects_mismatched_table_schema() {
        let (schema_bytes, _) = encode(&sample_batch());
        let table = Schema::new(vec![FieldSchema::new("id", FieldType::Integer)]);
        let err = ArrowDecoder::try_new(schema_bytes, table).unwrap_err();
        assert!(matches!(err, RowStreamError::Decode(_)));
    }

    #[test]
    fn malformed_payload_is_a_decode_error() {
        let (schema_bytes, batch_bytes) = encode(&sample_batch());
        let decoder = ArrowDecoder::try_new(schema_bytes, Schema::default()).unwrap();
        let truncated = &batch_bytes[..batch_bytes.len() / 2];
        assert!(matches!(
            decoder.decode(truncated),
            Err(RowStreamError::Decode(_))
        ));
    }
}
