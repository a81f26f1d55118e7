pub mod config;
pub mod db;
pub mod detector;
pub mod docker;
pub mod flag;
pub mod inserter;
pub mod lifecycle;
pub mod placement;
pub mod pool;
pub mod sweeper;
pub mod template;
pub mod types;

use color_eyre::Report;
use db::Db;
use sqlx::postgres::PgPoolOptions;
use std::time::Duration;

const GET_TIMEOUT: Duration = Duration::from_millis(10_000);
const MAX_CONS: u32 = 50;

/// Engine-object label that ties every service (and the grouped network) to
/// the owning instance, for removal-by-label.
pub const INSTANCE_LABEL: &str = "akvarium_id";

pub async fn db_connect(url: &str) -> Result<Db, Report> {
    Ok(Db::wrap(
        PgPoolOptions::new()
            .max_connections(MAX_CONS)
            .acquire_timeout(GET_TIMEOUT)
            .connect(url)
            .await?,
    ))
}
