use super::tables::TableType;
use super::timestamp::START_TIME;
use crate::schema::RECORD_SEQ;
use common::Result;
use datafusion::functions_window::expr_fn::row_number;
use datafusion::logical_expr::ExprFunctionExt;
use datafusion::prelude::*;

/// Page value of a genuine play event in the event log.
pub const NEXT_SONG_PAGE: &str = "NextSong";

const FIRST_RANK: &str = "__first_rank";

/// Restricts events to song plays.
pub fn next_song_plays(events: DataFrame) -> Result<DataFrame> {
    Ok(events.filter(col("page").eq(lit(NEXT_SONG_PAGE)))?)
}

/// Keeps the lowest-`record_seq` row per non-null value of `key_columns`.
/// Rows with a null key are dropped.
pub fn first_per_key(df: DataFrame, key_columns: &[&str]) -> Result<DataFrame> {
    let names: Vec<String> = df
        .schema()
        .fields()
        .iter()
        .map(|f| f.name().clone())
        .collect();

    let not_null = key_columns
        .iter()
        .map(|key| col(*key).is_not_null())
        .reduce(Expr::and)
        .unwrap_or_else(|| lit(true));

    let rank = row_number()
        .partition_by(key_columns.iter().map(|key| col(*key)).collect())
        .order_by(vec![col(RECORD_SEQ).sort(true, false)])
        .build()?
        .alias(FIRST_RANK);

    let columns: Vec<&str> = names.iter().map(String::as_str).collect();
    Ok(df
        .filter(not_null)?
        .window(vec![rank])?
        .filter(col(FIRST_RANK).eq(lit(1u64)))?
        .select_columns(&columns)?)
}

/// Builds the four dimension tables. Each is derived from a single source
/// frame; no joins happen here.
pub struct DimensionExtractor;

impl DimensionExtractor {
    pub fn songs(catalog: DataFrame) -> Result<DataFrame> {
        let projected = catalog.select(vec![
            col("song_id"),
            col("title"),
            col("artist_id"),
            col("year"),
            col("duration"),
            col(RECORD_SEQ),
        ])?;

        Ok(first_per_key(projected, &["song_id"])?.select_columns(TableType::Songs.columns())?)
    }

    pub fn artists(catalog: DataFrame) -> Result<DataFrame> {
        let projected = catalog.select(vec![
            col("artist_id"),
            col("artist_name").alias("name"),
            col("artist_location").alias("location"),
            col("artist_latitude").alias("latitude"),
            col("artist_longitude").alias("longitude"),
            col(RECORD_SEQ),
        ])?;

        Ok(first_per_key(projected, &["artist_id"])?
            .select_columns(TableType::Artists.columns())?)
    }

    /// Users seen in play events. A user whose level changes keeps the
    /// level of their first play.
    pub fn users(events: DataFrame) -> Result<DataFrame> {
        let projected = next_song_plays(events)?.select(vec![
            ident("userId").alias("user_id"),
            ident("firstName").alias("first_name"),
            ident("lastName").alias("last_name"),
            col("gender"),
            col("level"),
            col(RECORD_SEQ),
        ])?;

        Ok(first_per_key(projected, &["user_id"])?.select_columns(TableType::Users.columns())?)
    }

    /// Distinct calendar rows of play events with a valid timestamp. Takes
    /// the frame produced by `TimestampDeriver::derive`.
    pub fn time(derived_events: DataFrame) -> Result<DataFrame> {
        Ok(next_song_plays(derived_events)?
            .filter(col(START_TIME).is_not_null())?
            .select_columns(TableType::Time.columns())?
            .distinct()?)
    }
}
