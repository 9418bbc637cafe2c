//! Users and the materialised-path sponsor tree.

use crate::address::Address;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::ParseIntError;

/// Sequential primary key of a user. Also the component stored in paths.
pub type UserId = u64;

/// Separator between ids in [`User::path`].
pub const PATH_SEPARATOR: char = '.';

/// Highest level a user can reach; level tables carry `MAX_LEVEL + 1` entries.
pub const MAX_LEVEL: u8 = 9;

/// Paid membership tier of a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum UserType {
    #[default]
    Normal,
    Group,
    Community,
    Galaxy,
}

impl UserType {
    /// Holders sharing the GROUP/COMMUNITY fee dividend pool.
    pub fn shares_group_dividend(self) -> bool {
        matches!(self, UserType::Group | UserType::Community)
    }
}

impl fmt::Display for UserType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UserType::Normal => "NORMAL",
            UserType::Group => "GROUP",
            UserType::Community => "COMMUNITY",
            UserType::Galaxy => "GALAXY",
        };
        f.write_str(s)
    }
}

/// A registered account and its position in the sponsor tree.
///
/// `path` and `depth` are written once, on the first qualifying purchase,
/// and never change afterwards. That write-once rule is what keeps the tree
/// acyclic: a path can only extend the path of an already placed superior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub address: Address,
    pub superior: Option<Address>,
    /// Dot-delimited chain of ids from the root down to this user.
    pub path: Option<String>,
    pub depth: u32,
    pub level: u8,
    /// Externally assigned floor for `level`.
    pub min_level: u8,
    pub user_type: UserType,
    /// Nearest GALAXY ancestor, resolved at placement.
    pub leader: Option<Address>,
    pub interest_active: bool,
    pub buy_at: Option<DateTime<Utc>>,
    pub registered_at: DateTime<Utc>,
}

impl User {
    pub fn new(id: UserId, address: Address, superior: Option<Address>, now: DateTime<Utc>) -> Self {
        Self {
            id,
            address,
            superior,
            path: None,
            depth: 0,
            level: 0,
            min_level: 0,
            user_type: UserType::Normal,
            leader: None,
            interest_active: false,
            buy_at: None,
            registered_at: now,
        }
    }

    /// Whether the user has been placed in the tree.
    pub fn is_placed(&self) -> bool {
        self.path.is_some()
    }

    /// Ids of all ancestors, nearest first. Empty for roots and unplaced users.
    pub fn ancestor_ids(&self) -> Result<Vec<UserId>, ParseIntError> {
        let Some(path) = &self.path else {
            return Ok(Vec::new());
        };
        let mut ids = parse_path(path)?;
        ids.pop();
        ids.reverse();
        Ok(ids)
    }

    /// Prefix shared by the paths of every descendant.
    pub fn descendant_prefix(&self) -> Option<String> {
        self.path
            .as_ref()
            .map(|path| format!("{path}{PATH_SEPARATOR}"))
    }
}

/// Path of a newly placed user under `parent_path` (`None` for a root).
pub fn child_path(parent_path: Option<&str>, id: UserId) -> String {
    match parent_path {
        Some(parent) => format!("{parent}{PATH_SEPARATOR}{id}"),
        None => id.to_string(),
    }
}

/// Decode a path into its ids, root first.
pub fn parse_path(path: &str) -> Result<Vec<UserId>, ParseIntError> {
    path.split(PATH_SEPARATOR).map(str::parse).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_with_path(id: UserId, path: &str) -> User {
        let mut user = User::new(id, Address([id as u8; 20]), None, Utc::now());
        user.depth = path.matches(PATH_SEPARATOR).count() as u32;
        user.path = Some(path.to_string());
        user
    }

    #[test]
    fn ancestors_are_nearest_first() {
        let user = user_with_path(9, "1.5.9");
        assert_eq!(user.ancestor_ids().unwrap(), vec![5, 1]);
    }

    #[test]
    fn root_has_no_ancestors() {
        let root = user_with_path(1, "1");
        assert!(root.ancestor_ids().unwrap().is_empty());
        assert_eq!(root.descendant_prefix().as_deref(), Some("1."));
    }

    #[test]
    fn child_path_extends_parent() {
        assert_eq!(child_path(Some("1.5"), 9), "1.5.9");
        assert_eq!(child_path(None, 3), "3");
    }

    #[test]
    fn unplaced_user_has_no_prefix() {
        let user = User::new(4, Address([4; 20]), None, Utc::now());
        assert!(!user.is_placed());
        assert!(user.descendant_prefix().is_none());
    }
}
