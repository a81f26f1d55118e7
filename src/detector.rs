//! Decides whether a submitted flag is the user's own, someone else's, or
//! nobody's, and records cross-user submissions.

use async_trait::async_trait;
use chrono::Utc;
use tracing::warn;

use crate::db::{Db, DbError};
use crate::flag::FlagMode;
use crate::inserter::CheatingAttemptInserter;
use crate::types::Challenge;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Verdict {
    Correct,
    Incorrect,
    /// shown to the submitter as a plain incorrect answer
    Cheating { victim_user_id: i32 },
    /// no live instance for this challenge; solving requires one
    NoInstance,
}

impl Verdict {
    pub fn is_correct(&self) -> bool {
        matches!(self, Verdict::Correct)
    }
}

/// Client context captured into the audit record.
#[derive(Debug, Clone, Default)]
pub struct SubmissionContext {
    pub ip: String,
    pub user_agent: String,
}

/// One lookup capability over a flag store: which user was this flag minted
/// for? Implemented by the live-instance table and the solved-flag history.
#[async_trait]
pub trait FlagIndex: Send + Sync {
    async fn find_owner(&self, flag: &str, challenge_id: i32) -> Result<Option<i32>, DbError>;
}

pub struct LiveInstanceIndex {
    db: Db,
}

#[async_trait]
impl FlagIndex for LiveInstanceIndex {
    async fn find_owner(&self, flag: &str, challenge_id: i32) -> Result<Option<i32>, DbError> {
        self.db.live_flag_owner(flag, challenge_id).await
    }
}

pub struct SolvedFlagIndex {
    db: Db,
}

#[async_trait]
impl FlagIndex for SolvedFlagIndex {
    async fn find_owner(&self, flag: &str, challenge_id: i32) -> Result<Option<i32>, DbError> {
        self.db.solved_flag_owner(flag, challenge_id).await
    }
}

/// Queries the indexes in their fixed order; the first hit wins.
pub async fn find_owner(
    indexes: &[Box<dyn FlagIndex>],
    flag: &str,
    challenge_id: i32,
) -> Result<Option<i32>, DbError> {
    for index in indexes {
        if let Some(owner) = index.find_owner(flag, challenge_id).await? {
            return Ok(Some(owner));
        }
    }
    Ok(None)
}

/// The pure decision once the lookups are done.
pub fn classify(own_flag: &str, submission: &str, owner: Option<i32>, user_id: i32) -> Verdict {
    if own_flag == submission {
        return Verdict::Correct;
    }
    match owner {
        Some(victim) if victim != user_id => Verdict::Cheating {
            victim_user_id: victim,
        },
        // includes re-submitting one's own historical flag
        _ => Verdict::Incorrect,
    }
}

pub struct Detector {
    db: Db,
    indexes: Vec<Box<dyn FlagIndex>>,
}

impl Detector {
    pub fn new(db: Db) -> Self {
        // live instances first, then retained history
        let indexes: Vec<Box<dyn FlagIndex>> = vec![
            Box::new(LiveInstanceIndex { db: db.clone() }),
            Box::new(SolvedFlagIndex { db: db.clone() }),
        ];
        Self { db, indexes }
    }

    pub async fn check(
        &self,
        submission: &str,
        challenge: &Challenge,
        user_id: i32,
        ctx: &SubmissionContext,
    ) -> Result<Verdict, DbError> {
        let submission = submission.trim();

        // static challenges are decided by the platform's manual flag and
        // carry no per-user secret worth cross-checking
        if FlagMode::parse(&challenge.flag_mode) == FlagMode::Static {
            return Ok(match &challenge.manual_flag {
                Some(manual) if manual == submission => Verdict::Correct,
                _ => Verdict::Incorrect,
            });
        }

        let own = match self.db.user_instance(user_id).await? {
            Some(instance) if instance.challenge_id == challenge.id => instance,
            _ => return Ok(Verdict::NoInstance),
        };

        let owner = find_owner(&self.indexes, submission, challenge.id).await?;
        let verdict = classify(&own.flag, submission, owner, user_id);

        if let Verdict::Cheating { victim_user_id } = verdict {
            self.record_attempt(CheatingAttemptInserter {
                cheater_user_id: user_id,
                victim_user_id,
                challenge_id: challenge.id,
                submitted_flag: submission.to_string(),
                attempt_time: Utc::now().naive_utc(),
                cheater_ip: ctx.ip.clone(),
                user_agent: ctx.user_agent.clone(),
            })
            .await;
        }

        Ok(verdict)
    }

    /// Audit failures never block or change the flag check.
    async fn record_attempt(&self, attempt: CheatingAttemptInserter) {
        match self.db.add_cheating_attempt(&attempt).await {
            Ok(()) => warn!(
                "cheating detected: user {} submitted user {}'s flag for challenge {}",
                attempt.cheater_user_id, attempt.victim_user_id, attempt.challenge_id
            ),
            Err(e) => warn!(
                "failed to record cheating attempt by user {}: {e}",
                attempt.cheater_user_id
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedIndex(Option<i32>);

    #[async_trait]
    impl FlagIndex for FixedIndex {
        async fn find_owner(&self, _flag: &str, _challenge_id: i32) -> Result<Option<i32>, DbError> {
            Ok(self.0)
        }
    }

    struct BrokenIndex;

    #[async_trait]
    impl FlagIndex for BrokenIndex {
        async fn find_owner(&self, _flag: &str, _challenge_id: i32) -> Result<Option<i32>, DbError> {
            Err(DbError::Sqlx(sqlx::Error::RowNotFound))
        }
    }

    #[test]
    fn own_flag_is_correct() {
        assert_eq!(
            classify("flag{own}", "flag{own}", None, 1),
            Verdict::Correct
        );
        // even when the lookup would also find it live for the same user
        assert_eq!(
            classify("flag{own}", "flag{own}", Some(1), 1),
            Verdict::Correct
        );
    }

    #[test]
    fn someone_elses_flag_is_cheating() {
        assert_eq!(
            classify("flag{own}", "flag{other}", Some(2), 1),
            Verdict::Cheating { victim_user_id: 2 }
        );
    }

    #[test]
    fn own_historical_flag_is_plain_incorrect() {
        assert_eq!(
            classify("flag{fresh}", "flag{stale}", Some(1), 1),
            Verdict::Incorrect
        );
    }

    #[test]
    fn unowned_flag_is_plain_incorrect() {
        assert_eq!(classify("flag{own}", "flag{bogus}", None, 1), Verdict::Incorrect);
    }

    #[tokio::test]
    async fn live_index_is_consulted_before_history() {
        let indexes: Vec<Box<dyn FlagIndex>> =
            vec![Box::new(FixedIndex(Some(2))), Box::new(FixedIndex(Some(3)))];
        assert_eq!(find_owner(&indexes, "f", 1).await.unwrap(), Some(2));

        let indexes: Vec<Box<dyn FlagIndex>> =
            vec![Box::new(FixedIndex(None)), Box::new(FixedIndex(Some(3)))];
        assert_eq!(find_owner(&indexes, "f", 1).await.unwrap(), Some(3));

        let indexes: Vec<Box<dyn FlagIndex>> =
            vec![Box::new(FixedIndex(None)), Box::new(FixedIndex(None))];
        assert_eq!(find_owner(&indexes, "f", 1).await.unwrap(), None);
    }

    #[tokio::test]
    async fn index_errors_propagate() {
        let indexes: Vec<Box<dyn FlagIndex>> =
            vec![Box::new(BrokenIndex), Box::new(FixedIndex(Some(3)))];
        assert!(find_owner(&indexes, "f", 1).await.is_err());
    }
}
