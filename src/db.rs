use chrono::NaiveDateTime;

use crate::inserter::{CheatingAttemptInserter, InstanceInserter, SolvedFlagInserter};
use crate::types::{Challenge, CheatingAttempt, CheatingReportRow, CheatingStats, Instance};

#[derive(Clone)]
pub struct Db {
    conn: sqlx::Pool<sqlx::Postgres>,
}

impl Db {
    pub fn wrap(conn: sqlx::Pool<sqlx::Postgres>) -> Self {
        Self { conn }
    }

    pub async fn migrate(&self) -> Result<(), DbError> {
        sqlx::migrate!("./migrations").run(&self.conn).await?;
        Ok(())
    }

    // == instances ==

    /// Returns `None` when another request inserted a live instance for this
    /// user first; the caller falls back to the surviving row.
    pub async fn add_instance(
        &self,
        instance: &InstanceInserter,
    ) -> Result<Option<Instance>, DbError> {
        Ok(sqlx::query_as::<_, Instance>(
            "INSERT INTO instance (user_id, challenge_id, start_time, uuid, flag) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT DO NOTHING \
             RETURNING *",
        )
        .bind(instance.user_id)
        .bind(instance.challenge_id)
        .bind(instance.start_time)
        .bind(&instance.uuid)
        .bind(&instance.flag)
        .fetch_optional(&self.conn)
        .await?)
    }

    pub async fn user_instance(&self, user_id: i32) -> Result<Option<Instance>, DbError> {
        Ok(sqlx::query_as::<_, Instance>(
            "SELECT * FROM instance WHERE user_id = $1 AND status = 'alive'",
        )
        .bind(user_id)
        .fetch_optional(&self.conn)
        .await?)
    }

    pub async fn alive_count(&self) -> Result<i64, DbError> {
        Ok(
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM instance WHERE status = 'alive'")
                .fetch_one(&self.conn)
                .await?,
        )
    }

    pub async fn alive_page(&self, limit: i64, offset: i64) -> Result<Vec<Instance>, DbError> {
        Ok(sqlx::query_as::<_, Instance>(
            "SELECT * FROM instance WHERE status = 'alive' \
             ORDER BY start_time DESC LIMIT $1 OFFSET $2",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.conn)
        .await?)
    }

    pub async fn instances_started_before(
        &self,
        cutoff: NaiveDateTime,
    ) -> Result<Vec<Instance>, DbError> {
        Ok(sqlx::query_as::<_, Instance>(
            "SELECT * FROM instance WHERE status = 'alive' AND start_time < $1",
        )
        .bind(cutoff)
        .fetch_all(&self.conn)
        .await?)
    }

    /// Renewal resets the age reference and keeps the renew history.
    pub async fn renew_instance(&self, id: i32, now: NaiveDateTime) -> Result<(), DbError> {
        sqlx::query("UPDATE instance SET start_time = $2, renew_count = renew_count + 1 WHERE id = $1")
            .bind(id)
            .bind(now)
            .execute(&self.conn)
            .await?;
        Ok(())
    }

    pub async fn delete_instance(&self, id: i32) -> Result<(), DbError> {
        sqlx::query("DELETE FROM instance WHERE id = $1")
            .bind(id)
            .execute(&self.conn)
            .await?;
        Ok(())
    }

    pub async fn live_flag_owner(
        &self,
        flag: &str,
        challenge_id: i32,
    ) -> Result<Option<i32>, DbError> {
        Ok(sqlx::query_scalar::<_, i32>(
            "SELECT user_id FROM instance \
             WHERE flag = $1 AND challenge_id = $2 AND status = 'alive' \
             LIMIT 1",
        )
        .bind(flag)
        .bind(challenge_id)
        .fetch_optional(&self.conn)
        .await?)
    }

    // == solved flags ==

    /// No-op on repeated solve calls for the same (user, challenge, flag).
    pub async fn add_solved_flag(&self, solved: &SolvedFlagInserter) -> Result<bool, DbError> {
        let result = sqlx::query(
            "INSERT INTO solved_flag (user_id, challenge_id, flag, solved_time, instance_uuid) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (user_id, challenge_id, flag) DO NOTHING",
        )
        .bind(solved.user_id)
        .bind(solved.challenge_id)
        .bind(&solved.flag)
        .bind(solved.solved_time)
        .bind(&solved.instance_uuid)
        .execute(&self.conn)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn solved_flag_owner(
        &self,
        flag: &str,
        challenge_id: i32,
    ) -> Result<Option<i32>, DbError> {
        Ok(sqlx::query_scalar::<_, i32>(
            "SELECT user_id FROM solved_flag WHERE flag = $1 AND challenge_id = $2 LIMIT 1",
        )
        .bind(flag)
        .bind(challenge_id)
        .fetch_optional(&self.conn)
        .await?)
    }

    pub async fn delete_solved_flags_before(&self, cutoff: NaiveDateTime) -> Result<u64, DbError> {
        let result = sqlx::query("DELETE FROM solved_flag WHERE solved_time < $1")
            .bind(cutoff)
            .execute(&self.conn)
            .await?;
        Ok(result.rows_affected())
    }

    // == cheating attempts ==

    pub async fn add_cheating_attempt(
        &self,
        attempt: &CheatingAttemptInserter,
    ) -> Result<(), DbError> {
        sqlx::query(
            "INSERT INTO cheating_attempt \
             (cheater_user_id, victim_user_id, challenge_id, submitted_flag, attempt_time, cheater_ip, user_agent) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(attempt.cheater_user_id)
        .bind(attempt.victim_user_id)
        .bind(attempt.challenge_id)
        .bind(&attempt.submitted_flag)
        .bind(attempt.attempt_time)
        .bind(&attempt.cheater_ip)
        .bind(&attempt.user_agent)
        .execute(&self.conn)
        .await?;
        Ok(())
    }

    pub async fn cheating_count(&self) -> Result<i64, DbError> {
        Ok(
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM cheating_attempt")
                .fetch_one(&self.conn)
                .await?,
        )
    }

    pub async fn cheating_page(
        &self,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<CheatingAttempt>, DbError> {
        Ok(sqlx::query_as::<_, CheatingAttempt>(
            "SELECT * FROM cheating_attempt ORDER BY attempt_time DESC LIMIT $1 OFFSET $2",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.conn)
        .await?)
    }

    pub async fn cheating_stats(&self) -> Result<CheatingStats, DbError> {
        Ok(sqlx::query_as::<_, CheatingStats>(
            "SELECT COUNT(*) AS total_attempts, \
                    COUNT(DISTINCT cheater_user_id) AS unique_cheaters, \
                    COUNT(DISTINCT victim_user_id) AS unique_victims, \
                    COUNT(DISTINCT challenge_id) AS affected_challenges \
             FROM cheating_attempt",
        )
        .fetch_one(&self.conn)
        .await?)
    }

    /// Full audit log with display names resolved, newest first.
    pub async fn cheating_report(&self) -> Result<Vec<CheatingReportRow>, DbError> {
        Ok(sqlx::query_as::<_, CheatingReportRow>(
            "SELECT a.attempt_time, \
                    a.cheater_user_id, COALESCE(cu.name, '') AS cheater_name, \
                    a.victim_user_id, COALESCE(vu.name, '') AS victim_name, \
                    a.challenge_id, COALESCE(c.name, '') AS challenge_name, \
                    COALESCE(c.category, '') AS challenge_category, \
                    a.submitted_flag, a.cheater_ip, a.user_agent \
             FROM cheating_attempt AS a \
             LEFT JOIN account AS cu ON cu.id = a.cheater_user_id \
             LEFT JOIN account AS vu ON vu.id = a.victim_user_id \
             LEFT JOIN challenge AS c ON c.id = a.challenge_id \
             ORDER BY a.attempt_time DESC",
        )
        .fetch_all(&self.conn)
        .await?)
    }

    pub async fn delete_cheating_attempts_before(
        &self,
        cutoff: NaiveDateTime,
    ) -> Result<u64, DbError> {
        let result = sqlx::query("DELETE FROM cheating_attempt WHERE attempt_time < $1")
            .bind(cutoff)
            .execute(&self.conn)
            .await?;
        Ok(result.rows_affected())
    }

    // == challenges ==

    pub async fn challenge(&self, id: i32) -> Result<Option<Challenge>, DbError> {
        Ok(
            sqlx::query_as::<_, Challenge>("SELECT * FROM challenge WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.conn)
                .await?,
        )
    }

    // == network ranges ==

    pub async fn seed_network_range(&self, subnet: &str) -> Result<(), DbError> {
        sqlx::query("INSERT INTO network_range (subnet) VALUES ($1) ON CONFLICT (subnet) DO NOTHING")
            .bind(subnet)
            .execute(&self.conn)
            .await?;
        Ok(())
    }

    /// Atomically claims a free range; safe across concurrent workers.
    pub async fn acquire_network_range(&self) -> Result<Option<String>, DbError> {
        Ok(sqlx::query_scalar::<_, String>(
            "UPDATE network_range SET in_use = TRUE \
             WHERE subnet = ( \
                 SELECT subnet FROM network_range WHERE in_use = FALSE \
                 ORDER BY subnet LIMIT 1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING subnet",
        )
        .fetch_optional(&self.conn)
        .await?)
    }

    /// Idempotent; releasing an already-free range is a no-op.
    pub async fn release_network_range(&self, subnet: &str) -> Result<(), DbError> {
        sqlx::query("UPDATE network_range SET in_use = FALSE WHERE subnet = $1")
            .bind(subnet)
            .execute(&self.conn)
            .await?;
        Ok(())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum DbError {
    #[error("sqlx error")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}
