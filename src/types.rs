#[derive(sqlx::FromRow, serde::Serialize, Debug, Clone)]
pub struct Instance {
    pub id: i32,
    pub user_id: i32,
    pub challenge_id: i32,
    pub start_time: chrono::NaiveDateTime,
    pub renew_count: i32,
    pub status: String,
    /// random unique suffix, embedded in engine object names
    pub uuid: String,
    pub port: Option<i32>,
    pub flag: String,
}

impl Instance {
    /// `{user_id}-{uuid}` key shared by every engine object of this instance
    pub fn engine_key(&self) -> String {
        format!("{}-{}", self.user_id, self.uuid)
    }

    pub fn age_seconds(&self, now: chrono::NaiveDateTime) -> i64 {
        (now - self.start_time).num_seconds()
    }
}

#[derive(sqlx::FromRow, serde::Serialize, Debug, Clone)]
pub struct CheatingAttempt {
    pub id: i32,
    pub cheater_user_id: i32,
    pub victim_user_id: i32,
    pub challenge_id: i32,
    pub submitted_flag: String,
    pub attempt_time: chrono::NaiveDateTime,
    pub cheater_ip: String,
    pub user_agent: String,
}

/// One row of the audit CSV export, names already resolved.
#[derive(sqlx::FromRow, serde::Serialize, Debug, Clone)]
pub struct CheatingReportRow {
    pub attempt_time: chrono::NaiveDateTime,
    pub cheater_user_id: i32,
    pub cheater_name: String,
    pub victim_user_id: i32,
    pub victim_name: String,
    pub challenge_id: i32,
    pub challenge_name: String,
    pub challenge_category: String,
    pub submitted_flag: String,
    pub cheater_ip: String,
    pub user_agent: String,
}

#[derive(sqlx::FromRow, serde::Serialize, Debug, Clone)]
pub struct CheatingStats {
    pub total_attempts: i64,
    pub unique_cheaters: i64,
    pub unique_victims: i64,
    pub affected_challenges: i64,
}

/// Challenge definition, owned by the platform; this subsystem only reads it.
#[derive(sqlx::FromRow, serde::Serialize, Debug, Clone)]
pub struct Challenge {
    pub id: i32,
    pub name: String,
    pub category: String,
    /// a plain image reference, or a JSON object for grouped topologies
    pub image: String,
    pub memory_limit: String,
    pub cpu_limit: f64,
    pub redirect_type: String,
    pub redirect_port: i32,
    pub flag_mode: String,
    pub flag_static_prefix: String,
    pub manual_flag: Option<String>,
}

#[derive(serde::Serialize, Debug, Clone)]
pub struct ImageInfo {
    pub name: String,
    pub short_name: String,
    pub id: String,
    pub size: String,
    pub created: String,
}
