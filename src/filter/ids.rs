use serde::{Deserialize, Serialize};
use std::fmt;

/// Internal identifier of a stored entity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BigId(i64);

impl BigId {
    /// Reserved id meaning "no linked entity" (e.g. an observation without FOI).
    /// Also the default value.
    pub const NONE: BigId = BigId(0);

    pub const fn new(id: i64) -> Self {
        BigId(id)
    }

    pub fn id(&self) -> i64 {
        self.0
    }

    pub fn is_none(&self) -> bool {
        *self == Self::NONE
    }
}

impl From<i64> for BigId {
    fn from(id: i64) -> Self {
        BigId(id)
    }
}

impl fmt::Display for BigId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_none_sentinel() {
        assert!(BigId::NONE.is_none());
        assert!(!BigId::new(3).is_none());
        assert_eq!(BigId::from(0), BigId::NONE);
    }

    #[test]
    fn test_serde_transparent() {
        let ids: Vec<BigId> = serde_json::from_str("[3, 7, 9]").unwrap();
        assert_eq!(ids, vec![BigId::new(3), BigId::new(7), BigId::new(9)]);
        assert_eq!(serde_json::to_string(&BigId::new(42)).unwrap(), "42");
    }
}
