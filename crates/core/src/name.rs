//! Conflict rename factories.
//!
//! When a resolution needs to rename a node (name-clash loser, restored
//! node relocated to a sync root), it asks a [`NameFactory`] for candidate
//! names with a rising attempt number until it finds one that is free under
//! the target parent. Termination therefore never depends on factory
//! randomness.

use chrono::Utc;
use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::models::{FsNodeModel, NodeKey, NodeType};

/// Produces candidate names for a node involved in a naming conflict.
pub trait NameFactory<Id: NodeKey>: Send + Sync {
    /// The `attempt`-th candidate (starting at 1) for renaming `model`.
    fn candidate(&self, model: &FsNodeModel<Id>, attempt: u32) -> String;
}

// ---------------------------------------------------------------------------
// Numbered factory
// ---------------------------------------------------------------------------

/// Appends an ordinal: `Docs` becomes `Docs (1)`, `a.txt` becomes
/// `a (1).txt`. The default factory for name-clash losers.
#[derive(Debug, Default, Clone)]
pub struct NumberedNameFactory;

impl<Id: NodeKey> NameFactory<Id> for NumberedNameFactory {
    fn candidate(&self, model: &FsNodeModel<Id>, attempt: u32) -> String {
        let (stem, extension) = split_name(model);
        format!("{stem} ({attempt}){extension}")
    }
}

// ---------------------------------------------------------------------------
// Pattern factory
// ---------------------------------------------------------------------------

/// Expands a name pattern with placeholders:
///
/// | placeholder | replaced by |
/// |---|---|
/// | `{name}` | original name without extension (files) or full name (directories) |
/// | `{ext}` | extension including the dot, empty for directories |
/// | `{date}` | current date, `YYYY-MM-DD` |
/// | `{time}` | current time, `HHMMSS` |
/// | `{id}` | the node id |
/// | `{n}` | the attempt number |
/// | `{random}` | six random lowercase alphanumerics |
///
/// Used for delete-conflict restorations, where the new name should record
/// what happened (e.g. `"{name} (restored {date}){ext}"`).
#[derive(Debug, Clone)]
pub struct PatternNameFactory {
    pattern: String,
}

impl PatternNameFactory {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
        }
    }
}

impl<Id: NodeKey> NameFactory<Id> for PatternNameFactory {
    fn candidate(&self, model: &FsNodeModel<Id>, attempt: u32) -> String {
        let (stem, extension) = split_name(model);
        let now = Utc::now();

        let random: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
            .take(6)
            .map(char::from)
            .collect();

        self.pattern
            .replace("{name}", stem)
            .replace("{ext}", extension)
            .replace("{date}", &now.format("%Y-%m-%d").to_string())
            .replace("{time}", &now.format("%H%M%S").to_string())
            .replace("{id}", &model.id.to_string())
            .replace("{n}", &attempt.to_string())
            .replace("{random}", &random)
    }
}

/// Split a node name into stem and extension. Directory names never have
/// an extension.
fn split_name<Id: NodeKey>(model: &FsNodeModel<Id>) -> (&str, &str) {
    if model.node_type != NodeType::File {
        return (model.name.as_str(), "");
    }

    match model.name.rfind('.') {
        Some(dot) if dot > 0 => model.name.split_at(dot),
        _ => (model.name.as_str(), ""),
    }
}
