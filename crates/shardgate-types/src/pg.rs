use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Placement-group identifier: the pool it belongs to plus its hash seed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PgId {
    pub pool: u64,
    pub seed: u32,
}

impl PgId {
    pub const fn new(pool: u64, seed: u32) -> Self {
        Self { pool, seed }
    }
}

impl fmt::Display for PgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:x}", self.pool, self.seed)
    }
}

impl FromStr for PgId {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || TypeError::InvalidPgId(s.to_string());
        let (pool, seed) = s.split_once('.').ok_or_else(invalid)?;
        let pool = pool.parse::<u64>().map_err(|_| invalid())?;
        let seed = u32::from_str_radix(seed, 16).map_err(|_| invalid())?;
        Ok(Self { pool, seed })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_uses_hex_seed() {
        assert_eq!(PgId::new(2, 0x1f).to_string(), "2.1f");
    }

    #[test]
    fn parse_display_form() {
        assert_eq!("3.a".parse::<PgId>().unwrap(), PgId::new(3, 10));
        assert!("3".parse::<PgId>().is_err());
        assert!("3.zz".parse::<PgId>().is_err());
    }
}
