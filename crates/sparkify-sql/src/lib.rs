//! Statement catalog for the warehouse: DDL, bulk loads and star-schema inserts.

use std::fmt;

use sparkify_core::{Dialect, Table, WarehouseConfig};

pub const CRATE_NAME: &str = "sparkify-sql";

/// Page value of a play event in the event log.
pub const SONG_PLAY_PAGE: &str = "NextSong";

/// Malformed song records tolerated by the song bulk load. The event load tolerates none.
pub const SONG_COPY_MAX_ERRORS: u32 = 250;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Drop,
    Create,
    Copy,
    Insert,
}

impl fmt::Display for StatementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatementKind::Drop => write!(f, "drop"),
            StatementKind::Create => write!(f, "create"),
            StatementKind::Copy => write!(f, "copy"),
            StatementKind::Insert => write!(f, "insert"),
        }
    }
}

/// One SQL statement, executed and committed on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    pub table: Table,
    pub kind: StatementKind,
    pub sql: String,
}

impl Statement {
    fn new(table: Table, kind: StatementKind, sql: impl Into<String>) -> Self {
        Self {
            table,
            kind,
            sql: sql.into(),
        }
    }

    pub fn label(&self) -> String {
        format!("{} {}", self.kind, self.table)
    }
}

/// Quote a value as a SQL string literal.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

pub fn drop_table_queries() -> Vec<Statement> {
    Table::ALL
        .iter()
        .map(|&table| {
            Statement::new(
                table,
                StatementKind::Drop,
                format!("DROP TABLE IF EXISTS {table}"),
            )
        })
        .collect()
}

pub fn create_table_queries(dialect: Dialect) -> Vec<Statement> {
    Table::ALL
        .iter()
        .map(|&table| Statement::new(table, StatementKind::Create, create_table_sql(table, dialect)))
        .collect()
}

fn create_table_sql(table: Table, dialect: Dialect) -> String {
    let columns = match table {
        Table::StagingEvents => STAGING_EVENTS_COLUMNS.to_string(),
        Table::StagingSongs => STAGING_SONGS_COLUMNS.to_string(),
        Table::Songplays => {
            let identity = match dialect {
                Dialect::Redshift => "INT IDENTITY(0,1)",
                Dialect::Postgres => "INT GENERATED BY DEFAULT AS IDENTITY (START WITH 0 MINVALUE 0)",
            };
            let mut columns = format!(
                "songplay_id {identity},
        start_time BIGINT NOT NULL,
        user_id INT NOT NULL,
        level VARCHAR,
        song_id VARCHAR,
        artist_id VARCHAR,
        session_id VARCHAR NOT NULL,
        location VARCHAR,
        user_agent TEXT,
        PRIMARY KEY (songplay_id)"
            );
            // Redshift would accept this but never enforce it.
            if dialect == Dialect::Postgres {
                columns.push_str(",\n        UNIQUE (start_time, user_id, session_id)");
            }
            columns
        }
        Table::Users => USERS_COLUMNS.to_string(),
        Table::Songs => SONGS_COLUMNS.to_string(),
        Table::Artists => ARTISTS_COLUMNS.to_string(),
        Table::Time => TIME_COLUMNS.to_string(),
    };
    format!("CREATE TABLE IF NOT EXISTS {table} (\n        {columns}\n    )")
}

const STAGING_EVENTS_COLUMNS: &str = "artist TEXT,
        auth TEXT,
        first_name TEXT,
        gender TEXT,
        item_in_session INT,
        last_name TEXT,
        length FLOAT,
        level TEXT,
        location TEXT,
        method TEXT,
        page TEXT,
        registration TEXT,
        session_id TEXT,
        song TEXT,
        status TEXT,
        ts BIGINT,
        user_agent TEXT,
        user_id INT";

const STAGING_SONGS_COLUMNS: &str = "num_songs INT,
        artist_id TEXT,
        artist_latitude FLOAT,
        artist_longitude FLOAT,
        artist_location TEXT,
        artist_name TEXT,
        song_id TEXT,
        title TEXT,
        duration FLOAT,
        year INT";

const USERS_COLUMNS: &str = "user_id INT NOT NULL,
        first_name VARCHAR,
        last_name VARCHAR,
        gender VARCHAR,
        level VARCHAR,
        PRIMARY KEY (user_id)";

const SONGS_COLUMNS: &str = "song_id VARCHAR NOT NULL,
        title VARCHAR,
        artist_id VARCHAR,
        year INT,
        duration FLOAT,
        PRIMARY KEY (song_id)";

const ARTISTS_COLUMNS: &str = "artist_id VARCHAR NOT NULL,
        name VARCHAR,
        location VARCHAR,
        latitude FLOAT,
        longitude FLOAT,
        PRIMARY KEY (artist_id)";

const TIME_COLUMNS: &str = "start_time BIGINT NOT NULL,
        hour INT,
        day INT,
        week INT,
        month INT,
        year INT,
        weekday INT,
        PRIMARY KEY (start_time)";

/// Drop and recreate only the two staging tables, leaving the star schema alone.
pub fn staging_reset_queries(dialect: Dialect) -> Vec<Statement> {
    drop_table_queries()
        .into_iter()
        .chain(create_table_queries(dialect))
        .filter(|stmt| stmt.table.is_staging())
        .collect()
}

/// Bulk loads from S3 into the staging tables. Redshift only.
pub fn copy_table_queries(config: &WarehouseConfig) -> Vec<Statement> {
    let credentials = quote_literal(&format!("aws_iam_role={}", config.iam_role.arn.trim()));
    let region = quote_literal(&config.aws.region);

    let events = format!(
        "COPY {table}
    FROM {source}
        CREDENTIALS {credentials}
        JSON {jsonpath}
        REGION {region}",
        table = Table::StagingEvents,
        source = quote_literal(&config.s3.log_data),
        jsonpath = quote_literal(&config.s3.log_jsonpath),
    );

    let songs = format!(
        "COPY {table}
    FROM {source}
        CREDENTIALS {credentials}
        JSON 'auto' TRUNCATECOLUMNS
        MAXERROR AS {SONG_COPY_MAX_ERRORS}
        REGION {region}",
        table = Table::StagingSongs,
        source = quote_literal(&config.s3.song_data),
    );

    vec![
        Statement::new(Table::StagingEvents, StatementKind::Copy, events),
        Statement::new(Table::StagingSongs, StatementKind::Copy, songs),
    ]
}

/// Star-schema inserts in execution order: fact first, then the dimensions.
pub fn insert_table_queries(dialect: Dialect) -> Vec<Statement> {
    vec![
        Statement::new(Table::Songplays, StatementKind::Insert, songplay_insert(dialect)),
        Statement::new(Table::Users, StatementKind::Insert, user_insert(dialect)),
        Statement::new(Table::Songs, StatementKind::Insert, song_insert(dialect)),
        Statement::new(Table::Artists, StatementKind::Insert, artist_insert(dialect)),
        Statement::new(Table::Time, StatementKind::Insert, time_insert(dialect)),
    ]
}

/// Appends the "only if the key is absent" guard for `table`.
///
/// `redshift_guard` continues an existing WHERE clause.
fn idempotent(dialect: Dialect, table: Table, body: String, redshift_guard: String) -> String {
    match dialect {
        Dialect::Redshift => format!("{body}\n    AND {redshift_guard}"),
        Dialect::Postgres => format!(
            "{body}\n    ON CONFLICT ({}) DO NOTHING",
            table.natural_key().join(", ")
        ),
    }
}

/// Anti-join on a single-column natural key.
fn key_absent(source_column: &str, table: Table) -> String {
    let key = table.natural_key()[0];
    format!("{source_column} NOT IN (\n        SELECT DISTINCT {key} FROM {table}\n    )")
}

fn songplay_insert(dialect: Dialect) -> String {
    let body = format!(
        "INSERT INTO {fact} (
        start_time,
        user_id,
        level,
        song_id,
        artist_id,
        session_id,
        location,
        user_agent
    )
    SELECT DISTINCT
        events.ts,
        events.user_id,
        events.level,
        songs.song_id,
        songs.artist_id,
        events.session_id,
        events.location,
        events.user_agent
    FROM {events} AS events
    INNER JOIN {songs} AS songs
        ON events.song = songs.title
        AND events.artist = songs.artist_name
        AND events.length = songs.duration
    WHERE events.page = {page}
    AND events.ts IS NOT NULL
    AND events.user_id IS NOT NULL
    AND events.session_id IS NOT NULL",
        fact = Table::Songplays,
        events = Table::StagingEvents,
        songs = Table::StagingSongs,
        page = quote_literal(SONG_PLAY_PAGE),
    );
    let guard = format!(
        "NOT EXISTS (
        SELECT 1 FROM {fact} AS plays
        WHERE plays.start_time = events.ts
        AND plays.user_id = events.user_id
        AND plays.session_id = events.session_id
    )",
        fact = Table::Songplays,
    );
    idempotent(dialect, Table::Songplays, body, guard)
}

fn user_insert(dialect: Dialect) -> String {
    let body = format!(
        "INSERT INTO {users} (
        user_id,
        first_name,
        last_name,
        gender,
        level
    )
    SELECT DISTINCT
        user_id,
        first_name,
        last_name,
        gender,
        level
    FROM {events}
    WHERE page = {page}
    AND user_id IS NOT NULL",
        users = Table::Users,
        events = Table::StagingEvents,
        page = quote_literal(SONG_PLAY_PAGE),
    );
    idempotent(dialect, Table::Users, body, key_absent("user_id", Table::Users))
}

fn song_insert(dialect: Dialect) -> String {
    let body = format!(
        "INSERT INTO {songs} (
        song_id,
        title,
        artist_id,
        year,
        duration
    )
    SELECT DISTINCT
        song_id,
        title,
        artist_id,
        year,
        duration
    FROM {staging}
    WHERE song_id IS NOT NULL",
        songs = Table::Songs,
        staging = Table::StagingSongs,
    );
    idempotent(dialect, Table::Songs, body, key_absent("song_id", Table::Songs))
}

fn artist_insert(dialect: Dialect) -> String {
    let body = format!(
        "INSERT INTO {artists} (
        artist_id,
        name,
        location,
        latitude,
        longitude
    )
    SELECT DISTINCT
        artist_id,
        artist_name,
        artist_location,
        artist_latitude,
        artist_longitude
    FROM {staging}
    WHERE artist_id IS NOT NULL",
        artists = Table::Artists,
        staging = Table::StagingSongs,
    );
    idempotent(dialect, Table::Artists, body, key_absent("artist_id", Table::Artists))
}

// `ts` is epoch milliseconds; integer division drops the sub-second part.
fn time_insert(dialect: Dialect) -> String {
    let body = format!(
        "INSERT INTO {time} (
        start_time,
        hour,
        day,
        week,
        month,
        year,
        weekday
    )
    SELECT
        event_ts,
        EXTRACT(hour FROM start_at),
        EXTRACT(day FROM start_at),
        EXTRACT(week FROM start_at),
        EXTRACT(month FROM start_at),
        EXTRACT(year FROM start_at),
        EXTRACT(dow FROM start_at)
    FROM (
        SELECT DISTINCT
            ts AS event_ts,
            TIMESTAMP 'epoch' + ts / 1000 * INTERVAL '1 second' AS start_at
        FROM {events}
    ) AS events
    WHERE event_ts IS NOT NULL",
        time = Table::Time,
        events = Table::StagingEvents,
    );
    idempotent(dialect, Table::Time, body, key_absent("event_ts", Table::Time))
}
