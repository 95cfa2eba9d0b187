//! Version numbering among sibling messages.

use serde::{Deserialize, Serialize};

/// "Version N of M" summary for one user-message position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub current_version: usize,
    pub total_versions: usize,
}

impl VersionInfo {
    /// A position without alternatives.
    pub const SINGLE: VersionInfo = VersionInfo {
        current_version: 1,
        total_versions: 1,
    };
}

/// Rank `selected` among the distinct sibling tags.
///
/// The rank is 1-indexed in ascending tag order. A selected tag missing from
/// the set (a stale reference) ranks 1. An empty set reports a single version.
pub fn resolve_version(sibling_tags: &[u32], selected: u32) -> VersionInfo {
    let mut tags = sibling_tags.to_vec();
    tags.sort_unstable();
    tags.dedup();

    if tags.is_empty() {
        return VersionInfo::SINGLE;
    }

    let current_version = tags
        .iter()
        .position(|&tag| tag == selected)
        .map(|idx| idx + 1)
        .unwrap_or(1);

    VersionInfo {
        current_version,
        total_versions: tags.len(),
    }
}

/// Smallest non-negative tag not present in `used`.
pub fn lowest_unused_tag(used: &[u32]) -> u32 {
    let mut tag = 0;
    while used.contains(&tag) {
        tag += 1;
    }
    tag
}

/// Tag reached by moving one step in `forward` direction, wrapping at the ends.
///
/// Returns `None` when there is no other sibling to move to.
pub fn step_tag(sibling_tags: &[u32], selected: u32, forward: bool) -> Option<u32> {
    let mut tags = sibling_tags.to_vec();
    tags.sort_unstable();
    tags.dedup();
    if tags.len() < 2 {
        return None;
    }

    let idx = tags.iter().position(|&tag| tag == selected).unwrap_or(0);
    let next = if forward {
        (idx + 1) % tags.len()
    } else {
        (idx + tags.len() - 1) % tags.len()
    };
    Some(tags[next])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rank_is_position_in_sorted_distinct_tags() {
        assert_eq!(
            resolve_version(&[3, 0, 1, 1], 3),
            VersionInfo {
                current_version: 3,
                total_versions: 3
            }
        );
        assert_eq!(resolve_version(&[0], 0), VersionInfo::SINGLE);
    }

    #[test]
    fn test_stale_selection_ranks_first() {
        let info = resolve_version(&[0, 2], 5);
        assert_eq!(info.current_version, 1);
        assert_eq!(info.total_versions, 2);
        assert_eq!(resolve_version(&[], 4), VersionInfo::SINGLE);
    }

    #[test]
    fn test_lowest_unused_tag_fills_gaps() {
        assert_eq!(lowest_unused_tag(&[]), 0);
        assert_eq!(lowest_unused_tag(&[0, 1, 3]), 2);
        assert_eq!(lowest_unused_tag(&[1, 2]), 0);
    }

    #[test]
    fn test_step_wraps() {
        assert_eq!(step_tag(&[0, 1, 2], 2, true), Some(0));
        assert_eq!(step_tag(&[0, 1, 2], 0, false), Some(2));
        assert_eq!(step_tag(&[0, 1, 2], 1, true), Some(2));
        assert_eq!(step_tag(&[0], 0, true), None);
        assert_eq!(step_tag(&[0, 4], 9, true), Some(4));
    }
}
