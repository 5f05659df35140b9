//! Identifier minting
//!
//! Collision-resistant ids for captures and internal records. Injected so
//! tests can mint predictable sequences.

use parking_lot::Mutex;
use uuid::Uuid;

/// Source of fresh unique identifiers
pub trait IdMinter: Send + Sync {
    /// Mint a new collision-resistant identifier
    fn mint(&self) -> Uuid;
}

/// Random v4 identifiers (production)
#[derive(Debug, Default, Clone)]
pub struct RandomIds;

impl IdMinter for RandomIds {
    fn mint(&self) -> Uuid {
        Uuid::new_v4()
    }
}

/// Deterministic sequential identifiers for tests
#[derive(Default)]
pub struct SequentialIds {
    next: Mutex<u128>,
}

impl SequentialIds {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdMinter for SequentialIds {
    fn mint(&self) -> Uuid {
        let mut next = self.next.lock();
        *next += 1;
        Uuid::from_u128(*next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_ids_are_unique() {
        let minter = RandomIds;
        assert_ne!(minter.mint(), minter.mint());
    }

    #[test]
    fn test_sequential_ids_are_predictable() {
        let minter = SequentialIds::new();
        assert_eq!(minter.mint(), Uuid::from_u128(1));
        assert_eq!(minter.mint(), Uuid::from_u128(2));
    }
}
