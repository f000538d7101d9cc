//! Choosing the folders an action runs over.

use std::collections::HashSet;

use crate::types::Name;

/// Which folders of an account an action applies to.
///
/// With `all` set the folders come from a live `LIST`; otherwise from `include`, in the given
/// order. Either way names in `exclude` are dropped, duplicates keep their first position, and
/// listed names that are not selectable never appear.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FolderSelector {
    /// Use every selectable folder on the server.
    pub all: bool,
    /// Explicitly named folders.
    pub include: Vec<String>,
    /// Folders never to touch.
    pub exclude: Vec<String>,
}

impl FolderSelector {
    /// Every selectable folder.
    pub fn all() -> Self {
        FolderSelector {
            all: true,
            ..Default::default()
        }
    }

    /// Exactly these folders.
    pub fn only<I, S>(folders: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        FolderSelector {
            all: false,
            include: folders.into_iter().map(Into::into).collect(),
            exclude: Vec::new(),
        }
    }

    /// Whether resolving needs a `LIST` from the server.
    pub fn needs_listing(&self) -> bool {
        self.all && self.include.is_empty()
    }

    /// Resolve against the names a `LIST` returned. `listed` is only consulted when
    /// [`needs_listing`](Self::needs_listing) holds.
    pub fn resolve(&self, listed: &[Name]) -> Vec<String> {
        let candidates: Box<dyn Iterator<Item = &str>> = if self.needs_listing() {
            Box::new(
                listed
                    .iter()
                    .filter(|n| n.selectable())
                    .map(|n| n.name()),
            )
        } else {
            Box::new(self.include.iter().map(String::as_str))
        };

        let mut seen = HashSet::new();
        candidates
            .filter(|f| !self.exclude.iter().any(|e| e == f))
            .filter(|f| seen.insert(*f))
            .map(str::to_string)
            .collect()
    }

    /// Human-readable description for plan previews.
    pub fn describe(&self) -> String {
        let quoted = |names: &[String]| {
            names
                .iter()
                .map(|n| format!("`{}`", n))
                .collect::<Vec<_>>()
                .join(", ")
        };
        let mut place = if self.needs_listing() {
            "in all folders".to_string()
        } else {
            format!("in {}", quoted(&self.include))
        };
        if !self.exclude.is_empty() {
            place.push_str(&format!(" excluding {}", quoted(&self.exclude)));
        }
        place
    }
}
