use chrono::DateTime;
use common::Result;
use datafusion::arrow::array::{Int64Array, TimestampMillisecondArray};
use datafusion::arrow::datatypes::{DataType, TimeUnit};
use datafusion::common::{DataFusionError, ScalarValue};
use datafusion::execution::context::SessionContext;
use datafusion::logical_expr::{ColumnarValue, ScalarUDF, Volatility, create_udf};
use std::sync::Arc;

pub const START_TIME_UDF: &str = "epoch_ms_to_start_time";

/// Registers all UDFs with the SessionContext
pub fn register_udfs(ctx: &SessionContext) -> Result<()> {
    ctx.register_udf(start_time_udf());
    Ok(())
}

/// `epoch_ms_to_start_time(Int64) -> Timestamp(ms)`, truncated to the second.
pub fn start_time_udf() -> ScalarUDF {
    create_udf(
        START_TIME_UDF,
        vec![DataType::Int64],
        DataType::Timestamp(TimeUnit::Millisecond, None),
        Volatility::Immutable,
        Arc::new(epoch_ms_to_start_time),
    )
}

/// Drops the sub-second remainder of an epoch-millisecond value. Negative
/// values and values outside the calendar range have no start time.
pub fn truncate_epoch_millis(ts: i64) -> Option<i64> {
    if ts < 0 {
        return None;
    }
    DateTime::from_timestamp(ts / 1000, 0).map(|dt| dt.timestamp_millis())
}

fn epoch_ms_to_start_time(args: &[ColumnarValue]) -> datafusion::error::Result<ColumnarValue> {
    match &args[0] {
        ColumnarValue::Array(array) => {
            let int_array = array
                .as_any()
                .downcast_ref::<Int64Array>()
                .ok_or_else(|| DataFusionError::Internal("Expected int64 array".to_string()))?;

            let result: TimestampMillisecondArray = int_array
                .iter()
                .map(|opt_ts| opt_ts.and_then(truncate_epoch_millis))
                .collect();

            Ok(ColumnarValue::Array(Arc::new(result)))
        }
        ColumnarValue::Scalar(ScalarValue::Int64(ts)) => Ok(ColumnarValue::Scalar(
            ScalarValue::TimestampMillisecond(ts.and_then(truncate_epoch_millis), None),
        )),
        ColumnarValue::Scalar(other) => Err(DataFusionError::Internal(format!(
            "Expected int64 scalar, got {}",
            other.data_type()
        ))),
    }
}
