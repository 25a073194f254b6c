//! Static allow-list of chat users, swappable at runtime.

use std::{collections::HashSet, sync::Arc};

use arc_swap::ArcSwap;

use crate::credential::UserId;

/// An empty list admits everyone.
#[derive(Debug)]
pub struct AllowList {
    users: ArcSwap<HashSet<UserId>>,
}

impl Default for AllowList {
    fn default() -> Self {
        Self::new(HashSet::new())
    }
}

impl AllowList {
    pub fn new(users: HashSet<UserId>) -> Self {
        Self {
            users: ArcSwap::from_pointee(users),
        }
    }

    /// Parses one user id per line. Handles `\n` and `\r\n`; blank lines are skipped.
    pub fn parse(raw: &str) -> HashSet<UserId> {
        raw.lines()
            .map(UserId::new)
            .filter(|user_id| !user_id.is_empty())
            .collect()
    }

    pub fn permits(&self, user_id: &UserId) -> bool {
        let users = self.users.load();
        users.is_empty() || users.contains(user_id)
    }

    pub fn replace(&self, users: HashSet<UserId>) {
        self.users.store(Arc::new(users));
    }

    pub fn len(&self) -> usize {
        self.users.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
