use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Placement-group membership incarnation.
///
/// Advances every time the acting set changes. Any state captured under one
/// epoch is stale once the group has moved to a later one.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Epoch(pub u32);

impl Epoch {
    /// The epoch that follows this one.
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e{}", self.0)
    }
}

/// The most recent known-good version of an object.
///
/// Ordering: `epoch` → `counter` (total order).
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectVersion {
    /// Epoch in which the version was written.
    pub epoch: Epoch,
    /// Per-group write counter within that epoch.
    pub counter: u64,
}

impl ObjectVersion {
    /// "No specific version known". Every version satisfies it.
    pub const ZERO: Self = Self {
        epoch: Epoch(0),
        counter: 0,
    };

    pub const fn new(epoch: u32, counter: u64) -> Self {
        Self {
            epoch: Epoch(epoch),
            counter,
        }
    }

    /// Returns `true` if this is [`ObjectVersion::ZERO`].
    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    /// Returns `true` if `self` is at least as new as `target`.
    pub fn satisfies(&self, target: &Self) -> bool {
        self >= target
    }
}

impl PartialOrd for ObjectVersion {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ObjectVersion {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.epoch
            .cmp(&other.epoch)
            .then(self.counter.cmp(&other.counter))
    }
}

impl fmt::Debug for ObjectVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectVersion({}'{})", self.epoch.0, self.counter)
    }
}

impl fmt::Display for ObjectVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}'{}", self.epoch.0, self.counter)
    }
}

impl FromStr for ObjectVersion {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || TypeError::InvalidVersion(s.to_string());
        let (epoch, counter) = s.split_once('\'').ok_or_else(invalid)?;
        let epoch = epoch.parse::<u32>().map_err(|_| invalid())?;
        let counter = counter.parse::<u64>().map_err(|_| invalid())?;
        Ok(Self::new(epoch, counter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn ordering_epoch_first() {
        let a = ObjectVersion::new(4, 900);
        let b = ObjectVersion::new(5, 0);
        assert!(a < b);
    }

    #[test]
    fn ordering_counter_second() {
        let a = ObjectVersion::new(5, 2);
        let b = ObjectVersion::new(5, 3);
        assert!(a < b);
        assert!(b.satisfies(&a));
        assert!(!a.satisfies(&b));
    }

    #[test]
    fn zero_is_satisfied_by_everything() {
        assert!(ObjectVersion::ZERO.is_zero());
        assert!(ObjectVersion::ZERO.satisfies(&ObjectVersion::ZERO));
        assert!(ObjectVersion::new(1, 0).satisfies(&ObjectVersion::ZERO));
    }

    #[test]
    fn epoch_next_saturates() {
        assert_eq!(Epoch(5).next(), Epoch(6));
        assert_eq!(Epoch(u32::MAX).next(), Epoch(u32::MAX));
    }

    #[test]
    fn display_and_parse() {
        let v = ObjectVersion::new(5, 3);
        assert_eq!(v.to_string(), "5'3");
        assert_eq!("5'3".parse::<ObjectVersion>().unwrap(), v);
        assert_eq!(Epoch(7).to_string(), "e7");
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!("5-3".parse::<ObjectVersion>().is_err());
        assert!("x'3".parse::<ObjectVersion>().is_err());
        assert!("5'".parse::<ObjectVersion>().is_err());
    }

    proptest! {
        #[test]
        fn ordering_matches_tuple_ordering(
            e1 in any::<u32>(), c1 in any::<u64>(),
            e2 in any::<u32>(), c2 in any::<u64>(),
        ) {
            let a = ObjectVersion::new(e1, c1);
            let b = ObjectVersion::new(e2, c2);
            prop_assert_eq!(a.cmp(&b), (e1, c1).cmp(&(e2, c2)));
        }

        #[test]
        fn display_parses_back(e in any::<u32>(), c in any::<u64>()) {
            let v = ObjectVersion::new(e, c);
            prop_assert_eq!(v.to_string().parse::<ObjectVersion>().unwrap(), v);
        }
    }
}
