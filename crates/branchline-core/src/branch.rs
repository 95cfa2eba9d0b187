//! Branch addresses and their compressed storage keys.
//!
//! A branch path holds one sibling tag per user message. Zero is the original
//! choice, so trailing zeros are dropped when naming the storage location:
//! `[0] -> "0"`, `[1, 0, 0] -> "1"`, `[0, 1, 0] -> "0_1"`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::StoreError;

/// Separator between tags in a branch key.
pub const KEY_SEPARATOR: &str = "_";

/// Ordered sibling tags, one per user-message position.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BranchPath(Vec<u32>);

impl BranchPath {
    /// The root branch `[0]`.
    pub fn root() -> Self {
        Self(vec![0])
    }

    /// Build a path; an empty list denotes the root.
    pub fn new(tags: Vec<u32>) -> Self {
        if tags.is_empty() {
            Self::root()
        } else {
            Self(tags)
        }
    }

    pub fn tags(&self) -> &[u32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Tag at `index`, treating missing entries as the default `0`.
    pub fn tag_at(&self, index: usize) -> u32 {
        self.0.get(index).copied().unwrap_or(0)
    }

    /// Right-pad with zeros or truncate to exactly `n` entries.
    pub fn extend_to(&self, n: usize) -> Vec<u32> {
        let mut tags = self.0.clone();
        tags.resize(n, 0);
        tags
    }

    /// First `n` entries after extending.
    pub fn prefix_at(&self, n: usize) -> Vec<u32> {
        self.extend_to(n)
    }

    /// Copy of the first `n` entries followed by `tag`.
    pub fn with_tag_at(&self, n: usize, tag: u32) -> Self {
        let mut tags = self.extend_to(n);
        tags.push(tag);
        Self::new(tags)
    }

    /// Trailing zeros removed, keeping at least one entry.
    pub fn compressed(&self) -> Self {
        let mut tags = self.0.clone();
        while tags.len() > 1 && tags.last() == Some(&0) {
            tags.pop();
        }
        Self::new(tags)
    }

    /// Canonical storage key.
    pub fn to_key(&self) -> String {
        self.compressed()
            .0
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(KEY_SEPARATOR)
    }

    /// Parse a storage key; the empty key is the root.
    pub fn from_key(key: &str) -> Result<Self, StoreError> {
        let key = key.trim();
        if key.is_empty() {
            return Ok(Self::root());
        }
        key.split(KEY_SEPARATOR)
            .map(|part| {
                part.parse::<u32>().map_err(|_| {
                    StoreError::InvalidArgument(format!("malformed branch key '{key}'"))
                })
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Self::new)
    }

    /// Whether two paths name the same storage location.
    pub fn same_location(&self, other: &BranchPath) -> bool {
        self.compressed() == other.compressed()
    }
}

impl Default for BranchPath {
    fn default() -> Self {
        Self::root()
    }
}

impl From<Vec<u32>> for BranchPath {
    fn from(tags: Vec<u32>) -> Self {
        Self::new(tags)
    }
}

impl TryFrom<Vec<i64>> for BranchPath {
    type Error = StoreError;

    fn try_from(tags: Vec<i64>) -> Result<Self, Self::Error> {
        tags.into_iter()
            .map(|tag| {
                u32::try_from(tag).map_err(|_| {
                    StoreError::InvalidArgument(format!("branch tag {tag} is out of range"))
                })
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Self::new)
    }
}

impl FromStr for BranchPath {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_key(s)
    }
}

impl fmt::Display for BranchPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_key())
    }
}

/// Navigation direction among sibling versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Previous,
    Next,
}

impl TryFrom<i64> for Direction {
    type Error = StoreError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            -1 => Ok(Self::Previous),
            1 => Ok(Self::Next),
            other => Err(StoreError::InvalidArgument(format!(
                "unsupported direction {other}, expected -1 or 1"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(tags: &[u32]) -> BranchPath {
        BranchPath::new(tags.to_vec())
    }

    #[test]
    fn test_to_key_strips_trailing_zeros() {
        assert_eq!(path(&[0]).to_key(), "0");
        assert_eq!(path(&[1, 0, 0]).to_key(), "1");
        assert_eq!(path(&[0, 1, 0]).to_key(), "0_1");
        assert_eq!(path(&[0, 0, 0]).to_key(), "0");
        assert_eq!(path(&[2, 0, 3]).to_key(), "2_0_3");
    }

    #[test]
    fn test_from_key() {
        assert_eq!(BranchPath::from_key("0_1").unwrap(), path(&[0, 1]));
        assert_eq!(BranchPath::from_key("").unwrap(), BranchPath::root());
        assert_eq!(BranchPath::from_key("7").unwrap(), path(&[7]));
        assert!(matches!(
            BranchPath::from_key("0_x"),
            Err(StoreError::InvalidArgument(_))
        ));
        assert!(BranchPath::from_key("-1").is_err());
        assert!(BranchPath::from_key("1__2").is_err());
    }

    #[test]
    fn test_compression_round_trip() {
        for tags in [vec![0], vec![0, 1, 0], vec![3, 0, 0, 0], vec![0, 0, 2]] {
            let original = path(&tags);
            let parsed = BranchPath::from_key(&original.to_key()).unwrap();
            assert_eq!(parsed, original.compressed());
            assert!(!parsed.is_empty());
        }
    }

    #[test]
    fn test_extend_and_prefix() {
        assert_eq!(path(&[1]).extend_to(3), vec![1, 0, 0]);
        assert_eq!(path(&[1, 2, 3]).extend_to(2), vec![1, 2]);
        assert_eq!(path(&[1, 2, 3]).prefix_at(0), Vec::<u32>::new());
        assert_eq!(path(&[4]).tag_at(5), 0);
        assert_eq!(path(&[0]).with_tag_at(2, 1), path(&[0, 0, 1]));
        assert!(path(&[1, 0]).same_location(&path(&[1])));
    }

    #[test]
    fn test_signed_input_is_checked() {
        assert_eq!(BranchPath::try_from(vec![0_i64, 2]).unwrap(), path(&[0, 2]));
        assert!(BranchPath::try_from(vec![0_i64, -2]).is_err());
        assert_eq!(Direction::try_from(-1).unwrap(), Direction::Previous);
        assert!(Direction::try_from(0).is_err());
        assert!(Direction::try_from(2).is_err());
    }
}
