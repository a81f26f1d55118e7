//! State machine above the orchestrator: one live instance per user,
//! renewal limits, the global concurrency cap, and clean teardown.

use chrono::Utc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config;
use crate::db::{Db, DbError};
use crate::docker::{Engine, EngineError};
use crate::flag::{self, FlagError};
use crate::inserter::{InstanceInserter, SolvedFlagInserter};
use crate::pool::AddressPool;
use crate::types::Instance;

#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("unknown challenge {0}")]
    UnknownChallenge(i32),
    #[error("max instance count exceeded")]
    MaxInstances,
    #[error("max renewal count exceeded")]
    MaxRenewals,
    #[error("an instance for another challenge ({0}) is already running")]
    Conflict(String),
    #[error("no instance running")]
    NoInstance,
    #[error(transparent)]
    Flag(#[from] FlagError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Db(#[from] DbError),
}

#[derive(Clone)]
pub struct Controller {
    db: Db,
    pool: AddressPool,
    config: config::Root,
}

impl Controller {
    pub fn new(db: Db, config: config::Root) -> Self {
        let pool = AddressPool::new(db.clone());
        Self { db, pool, config }
    }

    pub fn pool(&self) -> &AddressPool {
        &self.pool
    }

    /// Provisions an instance for (user, challenge). An earlier instance of
    /// the same challenge is torn down first; one held for another challenge
    /// is a conflict, surfaced with that challenge's name.
    pub async fn start(
        &self,
        engine: &Engine,
        user_id: i32,
        challenge_id: i32,
    ) -> Result<Instance, LifecycleError> {
        let challenge = self
            .db
            .challenge(challenge_id)
            .await?
            .ok_or(LifecycleError::UnknownChallenge(challenge_id))?;

        if let Some(existing) = self.db.user_instance(user_id).await? {
            if existing.challenge_id != challenge_id {
                return Err(LifecycleError::Conflict(
                    self.challenge_name(existing.challenge_id).await?,
                ));
            }
            self.teardown(engine, &existing).await?;
        }

        if self.db.alive_count().await? >= self.config.instances.max_count {
            return Err(LifecycleError::MaxInstances);
        }

        let uuid = Uuid::new_v4().to_string();
        let flag = flag::generate(&self.config.flags, Some(&challenge), &uuid)?;

        let inserted = self
            .db
            .add_instance(&InstanceInserter {
                user_id,
                challenge_id,
                start_time: Utc::now().naive_utc(),
                uuid,
                flag,
            })
            .await?;

        let instance = match inserted {
            Some(instance) => instance,
            // a concurrent start won the insert race; its instance is just
            // as good, return it instead of erroring
            None => {
                return self
                    .db
                    .user_instance(user_id)
                    .await?
                    .ok_or(LifecycleError::NoInstance)
            }
        };

        if let Err(e) = engine.create_instance(&instance, &challenge, &self.pool).await {
            // leave no partially-applied engine state behind
            if let Err(cleanup) = engine
                .remove_instance(user_id, &instance.uuid, &self.pool)
                .await
            {
                warn!("cleanup after failed provisioning failed too: {cleanup}");
            }
            self.db.delete_instance(instance.id).await?;
            return Err(e.into());
        }

        info!(
            "started instance {} for user {user_id} challenge {challenge_id}",
            instance.uuid
        );
        Ok(instance)
    }

    /// Resets the age reference; renew history is kept and bounded.
    pub async fn renew(
        &self,
        user_id: i32,
        challenge_id: Option<i32>,
    ) -> Result<Instance, LifecycleError> {
        let mut instance = self
            .db
            .user_instance(user_id)
            .await?
            .ok_or(LifecycleError::NoInstance)?;

        if let Some(challenge_id) = challenge_id {
            if instance.challenge_id != challenge_id {
                return Err(LifecycleError::Conflict(
                    self.challenge_name(instance.challenge_id).await?,
                ));
            }
        }

        if instance.renew_count >= self.config.instances.max_renew_count {
            return Err(LifecycleError::MaxRenewals);
        }

        let now = Utc::now().naive_utc();
        self.db.renew_instance(instance.id, now).await?;
        instance.start_time = now;
        instance.renew_count += 1;
        Ok(instance)
    }

    /// Returns whether anything was removed; removing nothing is not an
    /// error so retried cleanups stay harmless.
    pub async fn remove(&self, engine: &Engine, user_id: i32) -> Result<bool, LifecycleError> {
        match self.db.user_instance(user_id).await? {
            Some(instance) => {
                self.teardown(engine, &instance).await?;
                info!("removed instance {} of user {user_id}", instance.uuid);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn expire(&self, engine: &Engine, instance: &Instance) -> Result<(), LifecycleError> {
        self.teardown(engine, instance).await?;
        info!(
            "expired instance {} of user {} after {}s",
            instance.uuid,
            instance.user_id,
            instance.age_seconds(Utc::now().naive_utc())
        );
        Ok(())
    }

    async fn teardown(&self, engine: &Engine, instance: &Instance) -> Result<(), LifecycleError> {
        engine
            .remove_instance(instance.user_id, &instance.uuid, &self.pool)
            .await?;
        self.db.delete_instance(instance.id).await?;
        Ok(())
    }

    pub async fn current(&self, user_id: i32) -> Result<Option<Instance>, LifecycleError> {
        Ok(self.db.user_instance(user_id).await?)
    }

    /// Solve hook: migrates the live flag into the solved history so
    /// cross-user submissions stay detectable after the instance is gone.
    /// Duplicate solve calls are no-ops.
    pub async fn record_solved(
        &self,
        user_id: i32,
        challenge_id: i32,
    ) -> Result<bool, LifecycleError> {
        let Some(instance) = self.db.user_instance(user_id).await? else {
            return Ok(false);
        };
        if instance.challenge_id != challenge_id {
            return Ok(false);
        }

        Ok(self
            .db
            .add_solved_flag(&SolvedFlagInserter {
                user_id,
                challenge_id,
                flag: instance.flag.clone(),
                solved_time: Utc::now().naive_utc(),
                instance_uuid: instance.uuid.clone(),
            })
            .await?)
    }

    pub fn remaining_seconds(&self, instance: &Instance) -> i64 {
        self.config.instances.timeout as i64 - instance.age_seconds(Utc::now().naive_utc())
    }

    async fn challenge_name(&self, challenge_id: i32) -> Result<String, DbError> {
        Ok(self
            .db
            .challenge(challenge_id)
            .await?
            .map(|challenge| challenge.name)
            .unwrap_or_else(|| challenge_id.to_string()))
    }
}
