//! Branch visibility reduction

use serde::{Deserialize, Serialize};

/// Aggregate visibility of a subtree
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BranchVisibility {
    Shown,
    Hidden,
    Mixed,
}

impl BranchVisibility {
    /// Visibility of a single node
    pub fn of(shown: bool) -> Self {
        if shown {
            Self::Shown
        } else {
            Self::Hidden
        }
    }

    /// Combine with a sibling branch
    pub fn combine(self, other: Self) -> Self {
        if self == other {
            self
        } else {
            Self::Mixed
        }
    }

    /// Reduce sibling branches; `None` for an empty set
    pub fn reduce(branches: impl IntoIterator<Item = Self>) -> Option<Self> {
        branches.into_iter().reduce(Self::combine)
    }
}
