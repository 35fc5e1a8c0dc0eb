use arrow::array::{Array, AsArray};
use arrow::datatypes::{
    DataType, Date32Type, Decimal128Type, Float64Type, Int32Type, Int64Type, TimeUnit,
    TimestampMillisecondType, TimestampSecondType, UInt64Type,
};
use arrow::record_batch::RecordBatch;
use common::{Error, Result};
use serde_json::{Number, Value};

/// Renders batches as one JSON object per row, keyed by column name.
pub fn batches_to_json(batches: &[RecordBatch]) -> Result<Vec<Value>> {
    let mut json_rows = Vec::new();

    for batch in batches {
        for row_idx in 0..batch.num_rows() {
            let mut row = serde_json::Map::new();

            for (col_idx, field) in batch.schema().fields().iter().enumerate() {
                let column = batch.column(col_idx);
                let value = arrow_array_to_json(column.as_ref(), row_idx)?;
                row.insert(field.name().clone(), value);
            }

            json_rows.push(Value::Object(row));
        }
    }

    Ok(json_rows)
}

/// Timestamps render as `YYYY-MM-DD HH:MM:SS` (UTC), dates as `YYYY-MM-DD`
/// and decimals as their exact string form.
pub fn arrow_array_to_json(array: &dyn Array, index: usize) -> Result<Value> {
    if array.is_null(index) {
        return Ok(Value::Null);
    }

    Ok(match array.data_type() {
        DataType::Int32 => Value::from(array.as_primitive::<Int32Type>().value(index)),
        DataType::Int64 => Value::from(array.as_primitive::<Int64Type>().value(index)),
        DataType::UInt64 => Value::from(array.as_primitive::<UInt64Type>().value(index)),
        DataType::Float64 => {
            let v = array.as_primitive::<Float64Type>().value(index);
            Number::from_f64(v).map(Value::Number).unwrap_or(Value::Null)
        }
        DataType::Utf8 => Value::String(array.as_string::<i32>().value(index).to_string()),
        DataType::LargeUtf8 => Value::String(array.as_string::<i64>().value(index).to_string()),
        DataType::Utf8View => Value::String(array.as_string_view().value(index).to_string()),
        DataType::Decimal128(_, _) => {
            Value::String(array.as_primitive::<Decimal128Type>().value_as_string(index))
        }
        DataType::Date32 => {
            let date = array
                .as_primitive::<Date32Type>()
                .value_as_date(index)
                .ok_or_else(|| Error::Other(format!("Date32 value out of range at row {}", index)))?;
            Value::String(date.format("%Y-%m-%d").to_string())
        }
        DataType::Timestamp(TimeUnit::Millisecond, _) => {
            let datetime = array
                .as_primitive::<TimestampMillisecondType>()
                .value_as_datetime(index)
                .ok_or_else(|| Error::Other(format!("Timestamp value out of range at row {}", index)))?;
            Value::String(datetime.format("%Y-%m-%d %H:%M:%S").to_string())
        }
        DataType::Timestamp(TimeUnit::Second, _) => {
            let datetime = array
                .as_primitive::<TimestampSecondType>()
                .value_as_datetime(index)
                .ok_or_else(|| Error::Other(format!("Timestamp value out of range at row {}", index)))?;
            Value::String(datetime.format("%Y-%m-%d %H:%M:%S").to_string())
        }
        other => {
            return Err(Error::Other(format!(
                "Unsupported column type for JSON rendering: {}",
                other
            )));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Decimal128Array, Int32Array, StringArray, TimestampMillisecondArray};
    use arrow::datatypes::{Field, Schema};
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn test_batches_to_json() {
        let schema = Arc::new(Schema::new(vec![
            Field::new("year", DataType::Int32, true),
            Field::new("name", DataType::Utf8, true),
            Field::new("latitude", DataType::Decimal128(10, 5), true),
            Field::new("start_time", DataType::Timestamp(TimeUnit::Millisecond, None), true),
        ]));
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int32Array::from(vec![Some(2018), None])),
                Arc::new(StringArray::from(vec![Some("Line Renaud"), Some("X")])),
                Arc::new(
                    Decimal128Array::from(vec![Some(3514968), None])
                        .with_precision_and_scale(10, 5)
                        .unwrap(),
                ),
                Arc::new(TimestampMillisecondArray::from(vec![Some(1541121934000), None])),
            ],
        )
        .unwrap();

        let rows = batches_to_json(&[batch]).unwrap();
        assert_eq!(
            rows[0],
            json!({
                "year": 2018,
                "name": "Line Renaud",
                "latitude": "35.14968",
                "start_time": "2018-11-02 01:25:34"
            })
        );
        assert_eq!(rows[1]["year"], Value::Null);
        assert_eq!(rows[1]["start_time"], Value::Null);
    }
}
