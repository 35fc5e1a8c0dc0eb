use super::udf::START_TIME_UDF;
use common::Result;
use datafusion::arrow::datatypes::DataType;
use datafusion::functions::expr_fn::date_part;
use datafusion::prelude::*;

pub const START_TIME: &str = "start_time";
pub const START_DATE: &str = "start_date";

/// Output column and the `date_part` field it is read from.
const CALENDAR_FIELDS: [(&str, &str); 6] = [
    ("hour", "hour"),
    ("day", "day"),
    ("week_of_year", "week"),
    ("month", "month"),
    ("year", "year"),
    ("weekday", "dow"),
];

/// Adds `start_time`, `start_date` and the calendar columns to an event
/// frame. Rows whose `ts` cannot be converted keep a null `start_time` and
/// null calendar fields; callers filter them out of time-derived tables.
pub struct TimestampDeriver;

impl TimestampDeriver {
    pub fn derive(events: DataFrame) -> Result<DataFrame> {
        let to_start_time = events.registry().udf(START_TIME_UDF)?;

        let mut df = events
            .with_column(START_TIME, to_start_time.call(vec![col("ts")]))?
            .with_column(START_DATE, cast(col(START_TIME), DataType::Date32))?;

        for (name, part) in CALENDAR_FIELDS {
            df = df.with_column(
                name,
                cast(date_part(lit(part), col(START_TIME)), DataType::Int32),
            )?;
        }

        Ok(df)
    }

    /// Events whose timestamp could not be derived.
    pub async fn count_malformed(derived: &DataFrame) -> Result<usize> {
        Ok(derived
            .clone()
            .filter(col(START_TIME).is_null())?
            .count()
            .await?)
    }
}
