//! Conflict rename grammar
//!
//! Files renamed aside during conflict resolution get a suffix inserted
//! before their final extension:
//!
//! - `report (conflicting copy from DEVICE 2026-08-02 14-03-55).pdf`
//! - `report (orphan 2026-08-02 14-03-55).pdf`
//!
//! The exact form is part of the observable contract. When the generated name
//! collides with an existing sibling, a numeric disambiguator is appended to
//! the suffix.

use chrono::{DateTime, Utc};

/// Which suffix family to produce
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuffixKind {
    Conflict,
    Orphan,
}

/// Generator for conflict and orphan names
#[derive(Debug, Clone)]
pub struct ConflictSuffix {
    device_name: String,
}

impl ConflictSuffix {
    pub fn new(device_name: impl Into<String>) -> Self {
        Self {
            device_name: device_name.into(),
        }
    }

    /// Builds the renamed-aside name for `original_name`.
    pub fn apply(&self, original_name: &str, kind: SuffixKind, at: DateTime<Utc>) -> String {
        self.apply_numbered(original_name, kind, at, None)
    }

    /// Builds a renamed-aside name guaranteed not to collide with `exists`.
    ///
    /// The closure is queried with each candidate; on collision a numeric
    /// disambiguator is appended (` 2`, ` 3`, ...).
    pub fn apply_unique<F>(
        &self,
        original_name: &str,
        kind: SuffixKind,
        at: DateTime<Utc>,
        mut exists: F,
    ) -> String
    where
        F: FnMut(&str) -> bool,
    {
        let candidate = self.apply_numbered(original_name, kind, at, None);
        if !exists(&candidate) {
            return candidate;
        }
        let mut counter = 2u32;
        loop {
            let numbered = self.apply_numbered(original_name, kind, at, Some(counter));
            if !exists(&numbered) {
                return numbered;
            }
            counter += 1;
        }
    }

    fn apply_numbered(
        &self,
        original_name: &str,
        kind: SuffixKind,
        at: DateTime<Utc>,
        number: Option<u32>,
    ) -> String {
        let timestamp = at.format("%Y-%m-%d %H-%M-%S");
        let mut suffix = match kind {
            SuffixKind::Conflict => {
                format!(" (conflicting copy from {} {})", self.device_name, timestamp)
            }
            SuffixKind::Orphan => format!(" (orphan {})", timestamp),
        };
        if let Some(n) = number {
            // numeric disambiguator goes inside the parenthesis
            suffix.truncate(suffix.len() - 1);
            suffix.push_str(&format!(" {})", n));
        }

        match split_extension(original_name) {
            Some((stem, ext)) => format!("{stem}{suffix}.{ext}"),
            None => format!("{original_name}{suffix}"),
        }
    }
}

/// Splits `name` at its final extension, if it has a meaningful one.
///
/// Dotfiles like `.bashrc` have no extension for renaming purposes.
fn split_extension(name: &str) -> Option<(&str, &str)> {
    let dot = name.rfind('.')?;
    if dot == 0 || dot == name.len() - 1 {
        return None;
    }
    Some((&name[..dot], &name[dot + 1..]))
}
