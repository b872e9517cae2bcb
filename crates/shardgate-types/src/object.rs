use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Identity of a logical object within one placement group.
///
/// Used as the key of the recovery session registry, so it is cheap to
/// compare and hash. The name is opaque to the recovery core.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ObjectId(String);

impl ObjectId {
    /// Create an object identity from a non-empty name.
    pub fn new(name: impl Into<String>) -> Result<Self, TypeError> {
        let name = name.into();
        if name.is_empty() {
            return Err(TypeError::EmptyObjectName);
        }
        Ok(Self(name))
    }

    /// The object name.
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.0)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ObjectId {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for ObjectId {
    type Error = TypeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ObjectId> for String {
    fn from(id: ObjectId) -> Self {
        id.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn empty_name_rejected() {
        assert_eq!(ObjectId::new(""), Err(TypeError::EmptyObjectName));
    }

    #[test]
    fn equal_names_hash_together() {
        let mut set = HashSet::new();
        set.insert(ObjectId::new("obj-1").unwrap());
        set.insert(ObjectId::new("obj-1").unwrap());
        set.insert(ObjectId::new("obj-2").unwrap());
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn display_and_debug() {
        let id: ObjectId = "rbd_data.1234".parse().unwrap();
        assert_eq!(id.to_string(), "rbd_data.1234");
        assert_eq!(format!("{id:?}"), "ObjectId(rbd_data.1234)");
    }

    #[test]
    fn serde_rejects_empty_name() {
        let parsed: Result<ObjectId, _> = serde_json::from_str("\"\"");
        assert!(parsed.is_err());
        let ok: ObjectId = serde_json::from_str("\"obj-9\"").unwrap();
        assert_eq!(ok.name(), "obj-9");
    }
}
