/// The five output tables of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableType {
    Songs,
    Artists,
    Users,
    Time,
    SongPlays,
}

impl TableType {
    /// Write order of a run.
    pub const ALL: [TableType; 5] = [
        TableType::Songs,
        TableType::Artists,
        TableType::Users,
        TableType::Time,
        TableType::SongPlays,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Songs => "songs",
            Self::Artists => "artists",
            Self::Users => "users",
            Self::Time => "time",
            Self::SongPlays => "songplays",
        }
    }

    pub fn partition_columns(&self) -> &'static [&'static str] {
        match self {
            Self::Songs => &["year", "artist_id"],
            Self::Time | Self::SongPlays => &["year", "month"],
            Self::Artists | Self::Users => &[],
        }
    }

    /// Column the table is sorted by before it is written.
    pub fn order_column(&self) -> &'static str {
        match self {
            Self::Songs => "song_id",
            Self::Artists => "artist_id",
            Self::Users => "user_id",
            Self::Time => "start_time",
            Self::SongPlays => "songplay_id",
        }
    }

    pub fn columns(&self) -> &'static [&'static str] {
        match self {
            Self::Songs => &["song_id", "title", "artist_id", "year", "duration"],
            Self::Artists => &["artist_id", "name", "location", "latitude", "longitude"],
            Self::Users => &["user_id", "first_name", "last_name", "gender", "level"],
            Self::Time => &[
                "start_time",
                "hour",
                "day",
                "week_of_year",
                "month",
                "year",
                "weekday",
            ],
            Self::SongPlays => &[
                "songplay_id",
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
            ],
        }
    }
}
