use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Where a stored copy of an object lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageLocation {
    /// The content-addressed directory next to the working copy.
    Local,
    /// The remote distributed storage backend.
    Remote,
}

impl StorageLocation {
    /// Every location, in canonical order.
    pub const ALL: [StorageLocation; 2] = [StorageLocation::Local, StorageLocation::Remote];

    /// The other location.
    pub fn opposite(self) -> Self {
        match self {
            Self::Local => Self::Remote,
            Self::Remote => Self::Local,
        }
    }
}

impl fmt::Display for StorageLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Remote => write!(f, "remote"),
        }
    }
}

impl FromStr for StorageLocation {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "remote" => Ok(Self::Remote),
            other => Err(TypeError::UnknownLocation(other.to_string())),
        }
    }
}

/// Ordered set of storage locations.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocationSet(BTreeSet<StorageLocation>);

impl LocationSet {
    pub fn new() -> Self {
        Self(BTreeSet::new())
    }

    pub fn local() -> Self {
        Self::of(&[StorageLocation::Local])
    }

    pub fn remote() -> Self {
        Self::of(&[StorageLocation::Remote])
    }

    pub fn both() -> Self {
        Self::of(&StorageLocation::ALL)
    }

    pub fn of(locations: &[StorageLocation]) -> Self {
        Self(locations.iter().copied().collect())
    }

    /// Returns `true` if the location was newly inserted.
    pub fn insert(&mut self, location: StorageLocation) -> bool {
        self.0.insert(location)
    }

    /// Returns `true` if the location was present.
    pub fn remove(&mut self, location: StorageLocation) -> bool {
        self.0.remove(&location)
    }

    pub fn contains(&self, location: StorageLocation) -> bool {
        self.0.contains(&location)
    }

    /// Returns `true` if every location in `other` is also in `self`.
    pub fn covers(&self, other: &LocationSet) -> bool {
        other.0.is_subset(&self.0)
    }

    /// Locations in `self` that are not in `other`.
    pub fn missing_from(&self, other: &LocationSet) -> Vec<StorageLocation> {
        self.0.difference(&other.0).copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = StorageLocation> + '_ {
        self.0.iter().copied()
    }
}

impl FromIterator<StorageLocation> for LocationSet {
    fn from_iter<I: IntoIterator<Item = StorageLocation>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for LocationSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.iter().map(|l| l.to_string()).collect();
        write!(f, "{{{}}}", names.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_location() {
        assert_eq!("local".parse::<StorageLocation>().unwrap(), StorageLocation::Local);
        assert_eq!("Remote".parse::<StorageLocation>().unwrap(), StorageLocation::Remote);
        assert!("moon".parse::<StorageLocation>().is_err());
    }

    #[test]
    fn opposite_flips() {
        assert_eq!(StorageLocation::Local.opposite(), StorageLocation::Remote);
        assert_eq!(StorageLocation::Remote.opposite(), StorageLocation::Local);
    }

    #[test]
    fn covers_and_missing() {
        let both = LocationSet::both();
        let local = LocationSet::local();
        assert!(both.covers(&local));
        assert!(!local.covers(&both));
        assert_eq!(both.missing_from(&local), vec![StorageLocation::Remote]);
        assert!(local.missing_from(&both).is_empty());
    }

    #[test]
    fn insert_reports_novelty() {
        let mut set = LocationSet::new();
        assert!(set.insert(StorageLocation::Local));
        assert!(!set.insert(StorageLocation::Local));
        assert_eq!(set.len(), 1);
        assert!(set.remove(StorageLocation::Local));
        assert!(set.is_empty());
    }

    #[test]
    fn display_lists_locations() {
        assert_eq!(LocationSet::both().to_string(), "{local, remote}");
    }

    #[test]
    fn serde_is_a_plain_list() {
        let json = serde_json::to_string(&LocationSet::both()).unwrap();
        assert_eq!(json, r#"["local","remote"]"#);
    }
}
