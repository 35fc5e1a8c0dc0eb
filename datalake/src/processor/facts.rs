use super::dimensions::{first_per_key, next_song_plays};
use super::tables::TableType;
use super::timestamp::START_TIME;
use crate::schema::RECORD_SEQ;
use common::Result;
use datafusion::arrow::datatypes::DataType;
use datafusion::common::JoinType;
use datafusion::functions_aggregate::expr_fn::min;
use datafusion::functions_window::expr_fn::row_number;
use datafusion::logical_expr::ExprFunctionExt;
use datafusion::prelude::*;

const SONGPLAY_RANK: &str = "__songplay_rank";

/// Event columns matched against the catalog natural key, pairwise with
/// [`CATALOG_KEY`].
const EVENT_KEY: [&str; 3] = ["artist", "song", "length"];
const CATALOG_KEY: [&str; 3] = ["artist_name", "title", "duration"];

/// Columns that identify a fact row when collapsing duplicates.
const FACT_COLUMNS: [&str; 10] = [
    "start_time",
    "user_id",
    "level",
    "song_id",
    "artist_id",
    "session_id",
    "location",
    "user_agent",
    "year",
    "month",
];

/// Resolves play events to catalog songs and numbers them.
pub struct FactResolver;

impl FactResolver {
    /// Builds the songplays table from the ingested catalog and the
    /// timestamp-derived events.
    ///
    /// Every play with a valid timestamp yields a row: events are LEFT
    /// joined on exact equality of (artist, song, length) against
    /// (artist_name, title, duration), so an unmatched play keeps null
    /// `song_id`/`artist_id`. `length` and `duration` are compared as
    /// floats with no tolerance. `songplay_id` is a dense `1..N` over the
    /// whole table, ordered by `start_time` and then by input order.
    pub fn songplays(catalog: DataFrame, derived_events: DataFrame) -> Result<DataFrame> {
        // One catalog entry per natural key, so a play resolves to at most
        // one song.
        let catalog_keys = first_per_key(
            catalog.select(vec![
                col("song_id"),
                col("artist_id"),
                col("artist_name"),
                col("title"),
                col("duration"),
                col(RECORD_SEQ),
            ])?,
            &CATALOG_KEY,
        )?
        .select_columns(&["song_id", "artist_id", "artist_name", "title", "duration"])?;

        let plays = next_song_plays(derived_events)?.filter(col(START_TIME).is_not_null())?;

        let joined = plays
            .join(catalog_keys, JoinType::Left, &EVENT_KEY, &CATALOG_KEY, None)?
            .select(vec![
                col(START_TIME),
                ident("userId").alias("user_id"),
                col("level"),
                col("song_id"),
                col("artist_id"),
                ident("sessionId").alias("session_id"),
                col("location"),
                ident("userAgent").alias("user_agent"),
                col("year"),
                col("month"),
                col(RECORD_SEQ),
            ])?;

        let distinct = joined.aggregate(
            FACT_COLUMNS.iter().map(|c| col(*c)).collect(),
            vec![min(col(RECORD_SEQ)).alias(RECORD_SEQ)],
        )?;

        let rank = row_number()
            .order_by(vec![
                col(START_TIME).sort(true, false),
                col(RECORD_SEQ).sort(true, false),
            ])
            .build()?
            .alias(SONGPLAY_RANK);

        Ok(distinct
            .window(vec![rank])?
            .with_column("songplay_id", cast(col(SONGPLAY_RANK), DataType::Int64))?
            .select_columns(TableType::SongPlays.columns())?)
    }

    /// Fact rows that matched no catalog entry.
    pub async fn count_unresolved(songplays: &DataFrame) -> Result<usize> {
        Ok(songplays
            .clone()
            .filter(col("song_id").is_null())?
            .count()
            .await?)
    }
}
