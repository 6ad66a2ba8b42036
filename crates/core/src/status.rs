//! Update status bitmask and its algebra.
//!
//! A node in an Update Tree carries a bitmask describing how it diverges
//! from the Synced Tree. The combination rules are not a plain bit algebra:
//! `Created` and `Deleted` absorb other flags, a `Created + Deleted` union
//! annihilates to `Unchanged`, and `Restore` is coupled to the presence of
//! `Created` or `Deleted`.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Divergence status of an Update Tree node relative to the Synced Tree.
///
/// An absent node is implicitly [`UpdateStatus::UNCHANGED`].
#[derive(Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(transparent)]
pub struct UpdateStatus(u8);

impl UpdateStatus {
    pub const UNCHANGED: Self = Self(0);
    pub const CREATED: Self = Self(1);
    pub const EDITED: Self = Self(1 << 1);
    pub const RENAMED: Self = Self(1 << 2);
    pub const MOVED: Self = Self(1 << 3);
    pub const DELETED: Self = Self(1 << 4);
    /// Marks a pending deletion override: the node must be re-created on
    /// the replica that deleted it.
    pub const RESTORE: Self = Self(1 << 5);

    /// All primary flags; `Restore` is a modifier, not a primary flag.
    pub const ALL: Self =
        Self(Self::CREATED.0 | Self::EDITED.0 | Self::RENAMED.0 | Self::MOVED.0 | Self::DELETED.0);

    pub const RENAMED_AND_MOVED: Self = Self(Self::RENAMED.0 | Self::MOVED.0);

    pub fn is_unchanged(self) -> bool {
        self == Self::UNCHANGED
    }

    /// Whether every flag of `other` is set. `other` must not be unchanged.
    pub fn contains(self, other: Self) -> bool {
        debug_assert!(
            !other.is_unchanged(),
            "contains() requires a non-empty flag set"
        );

        if self.is_unchanged() {
            return false;
        }

        self.0 & other.0 == other.0
    }

    /// Primary flags only (`Restore` stripped).
    pub fn primary(self) -> Self {
        Self(self.0 & Self::ALL.0)
    }

    /// Raw flag intersection, keeping `Restore` while `Deleted` or
    /// `Created` survives.
    pub fn intersect(self, other: Self) -> Self {
        let restore_kept = if other.0 & (Self::DELETED.0 | Self::CREATED.0) != 0 {
            Self::RESTORE.0
        } else {
            0
        };

        Self(self.0 & (other.0 | restore_kept))
    }

    /// Remove the flags of `other`. `Restore` is removed together with the
    /// last of `Deleted` / `Created`.
    pub fn minus(self, other: Self) -> Self {
        let restore_removed = if other.0 & (Self::DELETED.0 | Self::CREATED.0) != 0 {
            Self::RESTORE.0
        } else {
            0
        };

        Self(self.0 & !other.0 & !restore_removed)
    }

    /// Status union under the consolidation algebra.
    ///
    /// `Created` followed by `Deleted` annihilates (the node never reached
    /// the other replica); `Deleted` absorbs earlier change flags; `Created`
    /// absorbs later edits and moves. Applying further changes on top of an
    /// existing `Deleted`, or creating an already-tracked node, is a logic
    /// defect and asserts.
    pub fn union(self, other: Self) -> Self {
        if self == other {
            return self;
        }

        if self.is_unchanged() {
            return other;
        }

        if other.is_unchanged() {
            return self;
        }

        if self.contains(Self::CREATED) && other.contains(Self::DELETED) {
            return Self::UNCHANGED;
        }

        if other.contains(Self::DELETED) {
            return other;
        }

        if self.contains(Self::CREATED) {
            return self;
        }

        assert!(
            !other.contains(Self::CREATED) && !self.contains(Self::DELETED),
            "illegal status union: {self} + {other}"
        );

        Self(self.0 | other.0)
    }

    /// Set the given flags verbatim, without the union algebra. Used where
    /// history bits are intentionally retained (deletion cascades).
    pub fn insert(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Iterate the individual primary flags that are set.
    pub fn split(self) -> impl Iterator<Item = UpdateStatus> {
        [
            Self::CREATED,
            Self::EDITED,
            Self::RENAMED,
            Self::MOVED,
            Self::DELETED,
        ]
        .into_iter()
        .filter(move |flag| !self.is_unchanged() && self.contains(*flag))
    }

    /// Whether this mask is a legal combination.
    ///
    /// Legal masks: `Unchanged`; `Created` (optionally with `Restore`); any
    /// non-empty subset of `Edited | Renamed | Moved`; `Deleted` with
    /// optional retained `Edited` / `Renamed` history bits and optional
    /// `Restore`. `Restore` never stands alone and `Moved` never survives a
    /// deletion (the cascade undoes moves first).
    pub fn is_legal(self) -> bool {
        let has = |flag: Self| self.0 & flag.0 != 0;

        if self.is_unchanged() {
            return true;
        }

        if has(Self::RESTORE) && !has(Self::CREATED) && !has(Self::DELETED) {
            return false;
        }

        if has(Self::CREATED) {
            return self.primary() == Self::CREATED;
        }

        if has(Self::DELETED) {
            return !has(Self::MOVED);
        }

        // Some subset of Edited | Renamed | Moved.
        true
    }
}

impl UpdateStatus {
    fn fmt_flags(self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unchanged() {
            return write!(f, "unchanged");
        }

        let names = [
            (Self::CREATED, "created"),
            (Self::EDITED, "edited"),
            (Self::RENAMED, "renamed"),
            (Self::MOVED, "moved"),
            (Self::DELETED, "deleted"),
            (Self::RESTORE, "restore"),
        ];

        let mut first = true;
        for (flag, name) in names {
            if self.0 & flag.0 != 0 {
                if !first {
                    write!(f, "|")?;
                }
                first = false;
                write!(f, "{name}")?;
            }
        }

        Ok(())
    }
}

impl fmt::Debug for UpdateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_flags(f)
    }
}

impl fmt::Display for UpdateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_flags(f)
    }
}
