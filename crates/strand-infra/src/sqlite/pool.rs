//! Database pool with split reader/writer connections in WAL mode.
//!
//! SQLite allows only one writer at a time: a multi-connection reader pool
//! serves concurrent SELECTs while a single-connection writer pool
//! serializes all mutations. Both enforce foreign keys and use a 5-second
//! busy timeout. Migrations run on the writer before the reader opens.

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

/// Split read/write pool for one SQLite file.
#[derive(Clone)]
pub struct DatabasePool {
    pub reader: SqlitePool,
    pub writer: SqlitePool,
}

impl DatabasePool {
    /// Open (creating if missing) and migrate a database file.
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        // `:memory:` is a distinct database per connection, so a split pool
        // would read from a different database than it writes. Tests that ask
        // for it get one shared single-connection pool instead.
        if database_url.contains(":memory:") {
            let opts = SqliteConnectOptions::from_str(database_url)?
                .journal_mode(SqliteJournalMode::Memory)
                .foreign_keys(true);
            let pool = SqlitePoolOptions::new()
                .max_connections(1)
                .connect_with(opts)
                .await?;
            sqlx::migrate!("../../migrations").run(&pool).await?;
            return Ok(Self {
                reader: pool.clone(),
                writer: pool,
            });
        }

        let base_opts = SqliteConnectOptions::from_str(database_url)?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5))
            .create_if_missing(true);

        let read_opts = base_opts.clone().read_only(true);
        let write_opts = base_opts;

        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(write_opts)
            .await?;

        sqlx::migrate!("../../migrations").run(&writer).await?;

        let reader = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(read_opts)
            .await?;

        Ok(Self { reader, writer })
    }
}

/// Default database URL: `$STRAND_DATA_DIR/strand.db`, falling back to
/// `~/.strand/strand.db`.
pub fn default_database_url() -> String {
    let data_dir = std::env::var("STRAND_DATA_DIR").unwrap_or_else(|_| {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        format!("{home}/.strand")
    });
    format!("sqlite://{data_dir}/strand.db")
}
