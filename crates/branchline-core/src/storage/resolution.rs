//! Resolution walk over parent-linked message rows.
//!
//! Starting at position 0, each step keeps the rows whose `parent_message_id`
//! is the row chosen one position earlier. User positions pick the sibling
//! named by the branch path; other positions pick the active-version override
//! if one is set, else the highest version. The walk stops at the first
//! position with nothing to choose.
//!
//! Rows written before parent links existed carry no parent. Only those rows
//! take part in the version-number fallback, and every use is logged.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

use crate::branch::BranchPath;
use crate::models::{Message, Role};

/// Position to pinned version tag.
pub type ActiveVersions = BTreeMap<u32, u32>;

/// One stored message version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRow {
    pub message: Message,
    pub position: u32,
    pub version: u32,
    #[serde(default)]
    pub parent_message_id: Option<String>,
}

impl MessageRow {
    pub fn is_child_of(&self, parent: Option<&str>) -> bool {
        self.parent_message_id.as_deref() == parent
    }
}

/// How user positions pick a sibling.
#[derive(Debug, Clone, Copy)]
pub enum UserSelection<'a> {
    /// Follow the path; stop where its tag does not exist.
    Path(&'a BranchPath),
    /// Follow the path up to and including user index `fixed`, then take the
    /// lowest tag at every later user position.
    Snap { path: &'a BranchPath, fixed: usize },
}

impl UserSelection<'_> {
    fn choose(&self, user_index: usize, available: &[u32]) -> Option<u32> {
        match *self {
            UserSelection::Path(path) => {
                let tag = path.tag_at(user_index);
                available.contains(&tag).then_some(tag)
            }
            UserSelection::Snap { path, fixed } if user_index <= fixed => {
                let tag = path.tag_at(user_index);
                available.contains(&tag).then_some(tag)
            }
            UserSelection::Snap { .. } => available.iter().min().copied(),
        }
    }
}

/// Result of one walk.
#[derive(Debug, Default)]
pub struct Resolution<'a> {
    pub rows: Vec<&'a MessageRow>,
    /// Chosen tag per resolved user message.
    pub user_tags: Vec<u32>,
    /// Sibling tags available per resolved user message.
    pub user_siblings: Vec<Vec<u32>>,
    /// Position of each resolved user message.
    pub user_positions: Vec<usize>,
}

impl Resolution<'_> {
    /// Branch address of the resolved sequence.
    pub fn branch(&self) -> BranchPath {
        BranchPath::new(self.user_tags.clone()).compressed()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.rows.iter().map(|row| row.message.clone()).collect()
    }

    /// Ids of the resolved rows at and after `position`.
    pub fn ids_from(&self, position: usize) -> Vec<&str> {
        self.rows
            .iter()
            .skip(position)
            .map(|row| row.message.id.as_str())
            .collect()
    }
}

/// Rows grouped by position.
pub fn by_position(rows: &[MessageRow]) -> BTreeMap<u32, Vec<&MessageRow>> {
    let mut grouped: BTreeMap<u32, Vec<&MessageRow>> = BTreeMap::new();
    for row in rows {
        grouped.entry(row.position).or_default().push(row);
    }
    grouped
}

/// Rows that continue the lineage after `parent`.
fn continuations<'a>(at: &[&'a MessageRow], parent: Option<&MessageRow>) -> Vec<&'a MessageRow> {
    let Some(parent) = parent else {
        return at.to_vec();
    };

    let linked: Vec<&MessageRow> = at
        .iter()
        .copied()
        .filter(|row| row.is_child_of(Some(&parent.message.id)))
        .collect();
    if !linked.is_empty() {
        return linked;
    }

    let legacy: Vec<&MessageRow> = at
        .iter()
        .copied()
        .filter(|row| row.parent_message_id.is_none())
        .collect();
    if legacy.is_empty() {
        return legacy;
    }

    warn!(
        position = legacy[0].position,
        parent = %parent.message.id,
        "Resolving rows without parent links by version number"
    );
    let same_version: Vec<&MessageRow> = legacy
        .iter()
        .copied()
        .filter(|row| row.version == parent.version)
        .collect();
    if same_version.is_empty() {
        legacy
    } else {
        same_version
    }
}

/// Walk the rows along `selection`.
pub fn resolve<'a>(
    rows: &'a [MessageRow],
    overrides: &ActiveVersions,
    selection: UserSelection<'_>,
) -> Resolution<'a> {
    let grouped = by_position(rows);
    let mut resolution = Resolution::default();
    let mut parent: Option<&MessageRow> = None;
    let mut position: u32 = 0;

    while let Some(at) = grouped.get(&position) {
        let candidates = continuations(at, parent);
        if candidates.is_empty() {
            break;
        }

        let chosen = if candidates.iter().any(|row| row.message.role == Role::User) {
            let users: Vec<&MessageRow> = candidates
                .into_iter()
                .filter(|row| row.message.role == Role::User)
                .collect();
            let mut tags: Vec<u32> = users.iter().map(|row| row.version).collect();
            tags.sort_unstable();
            tags.dedup();

            let Some(tag) = selection.choose(resolution.user_tags.len(), &tags) else {
                break;
            };
            let Some(row) = users.iter().copied().find(|row| row.version == tag) else {
                break;
            };
            resolution.user_tags.push(tag);
            resolution.user_siblings.push(tags);
            resolution.user_positions.push(position as usize);
            row
        } else {
            let pinned = overrides
                .get(&position)
                .and_then(|tag| candidates.iter().copied().find(|row| row.version == *tag));
            match pinned.or_else(|| candidates.iter().copied().max_by_key(|row| row.version)) {
                Some(row) => row,
                None => break,
            }
        };

        resolution.rows.push(chosen);
        parent = Some(chosen);
        position += 1;
    }

    resolution
}

/// Tags of the rows at `position` that share `parent`.
pub fn sibling_versions(rows: &[MessageRow], position: u32, parent: Option<&str>) -> Vec<u32> {
    rows.iter()
        .filter(|row| row.position == position && row.is_child_of(parent))
        .map(|row| row.version)
        .collect()
}

/// Ids of `root` and every row descending from it through parent links.
pub fn subtree_ids<'a>(rows: &'a [MessageRow], root: &'a str) -> BTreeSet<&'a str> {
    let mut ids = BTreeSet::from([root]);
    let mut frontier = vec![root];
    while let Some(parent) = frontier.pop() {
        for row in rows {
            if row.is_child_of(Some(parent)) && ids.insert(row.message.id.as_str()) {
                frontier.push(row.message.id.as_str());
            }
        }
    }
    ids
}

/// Every distinct branch address that reaches a leaf row.
pub fn leaf_branches(rows: &[MessageRow]) -> Vec<BranchPath> {
    let grouped = by_position(rows);
    let mut branches = BTreeSet::new();
    let mut stack: Vec<(Option<&MessageRow>, u32, Vec<u32>)> = vec![(None, 0, Vec::new())];

    while let Some((parent, position, tags)) = stack.pop() {
        let children = grouped
            .get(&position)
            .map(|at| continuations(at, parent))
            .unwrap_or_default();
        if children.is_empty() {
            branches.insert(BranchPath::new(tags).compressed().tags().to_vec());
            continue;
        }
        for child in children {
            let mut child_tags = tags.clone();
            if child.message.role == Role::User {
                child_tags.push(child.version);
            }
            stack.push((Some(child), position + 1, child_tags));
        }
    }

    branches.into_iter().map(BranchPath::new).collect()
}
