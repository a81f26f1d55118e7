//! Recyclable private address ranges for grouped topologies.
//!
//! The free/in-use sets live in Postgres so acquisition is atomic across
//! request workers; a range only returns to the free set after the owning
//! overlay network is confirmed removed.

use ipnet::Ipv4Net;
use thiserror::Error;

use crate::config;
use crate::db::{Db, DbError};

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("address pool exhausted")]
    Exhausted,
    #[error("invalid base subnet '{0}'")]
    InvalidBase(String),
    #[error(transparent)]
    Db(#[from] DbError),
}

#[derive(Clone)]
pub struct AddressPool {
    db: Db,
}

impl AddressPool {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Idempotently registers every sub-block of the configured base range.
    pub async fn seed(&self, docker: &config::Docker) -> Result<(), PoolError> {
        for subnet in subnets(&docker.subnet, docker.subnet_prefix_len)? {
            self.db.seed_network_range(&subnet).await?;
        }
        Ok(())
    }

    pub async fn acquire(&self) -> Result<String, PoolError> {
        self.db
            .acquire_network_range()
            .await?
            .ok_or(PoolError::Exhausted)
    }

    /// Releasing a range that is already free is a no-op, so retried
    /// teardowns are harmless.
    pub async fn release(&self, subnet: &str) -> Result<(), PoolError> {
        Ok(self.db.release_network_range(subnet).await?)
    }
}

/// Carves `base` into disjoint `/prefix_len` blocks.
pub fn subnets(base: &str, prefix_len: u8) -> Result<Vec<String>, PoolError> {
    let base: Ipv4Net = base
        .parse()
        .map_err(|_| PoolError::InvalidBase(base.to_string()))?;

    Ok(base
        .subnets(prefix_len)
        .map_err(|_| PoolError::InvalidBase(base.to_string()))?
        .map(|net| net.to_string())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sixteen_splits_into_256_twentyfours() {
        let blocks = subnets("10.233.0.0/16", 24).unwrap();
        assert_eq!(blocks.len(), 256);
        assert_eq!(blocks[0], "10.233.0.0/24");
        assert_eq!(blocks[255], "10.233.255.0/24");
    }

    #[test]
    fn blocks_are_disjoint() {
        let blocks = subnets("192.168.0.0/22", 24).unwrap();
        assert_eq!(blocks.len(), 4);
        let unique: std::collections::HashSet<_> = blocks.iter().collect();
        assert_eq!(unique.len(), blocks.len());
    }

    #[test]
    fn garbage_base_is_rejected() {
        assert!(matches!(
            subnets("not-a-subnet", 24),
            Err(PoolError::InvalidBase(_))
        ));
        // cannot carve /24s out of a /28
        assert!(matches!(
            subnets("10.0.0.0/28", 24),
            Err(PoolError::InvalidBase(_))
        ));
    }
}
