#[derive(Debug, Clone)]
pub struct InstanceInserter {
    pub user_id: i32,
    pub challenge_id: i32,
    pub start_time: chrono::NaiveDateTime,
    pub uuid: String,
    pub flag: String,
}

#[derive(Debug, Clone)]
pub struct SolvedFlagInserter {
    pub user_id: i32,
    pub challenge_id: i32,
    pub flag: String,
    pub solved_time: chrono::NaiveDateTime,
    pub instance_uuid: String,
}

#[derive(Debug, Clone)]
pub struct CheatingAttemptInserter {
    pub cheater_user_id: i32,
    pub victim_user_id: i32,
    pub challenge_id: i32,
    pub submitted_flag: String,
    pub attempt_time: chrono::NaiveDateTime,
    pub cheater_ip: String,
    pub user_agent: String,
}
