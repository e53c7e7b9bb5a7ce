//! Registry Path Resolver
//!
//! Parses textual, hive-qualified registry paths such as
//! `"HKEY_CURRENT_USER\SOFTWARE\Nimbus Labs"` into a hive handle plus the
//! remaining sub-path. An optional leading `"Computer\"` prefix (the form
//! regedit shows in its address bar) is accepted and stripped.

use crate::registry::RegistryError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One of the five well-known registry hives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Hive {
    ClassesRoot,
    CurrentUser,
    LocalMachine,
    Users,
    CurrentConfig,
}

impl Hive {
    /// Canonical hive name as used in textual registry paths.
    pub fn name(&self) -> &'static str {
        match self {
            Hive::ClassesRoot => "HKEY_CLASSES_ROOT",
            Hive::CurrentUser => "HKEY_CURRENT_USER",
            Hive::LocalMachine => "HKEY_LOCAL_MACHINE",
            Hive::Users => "HKEY_USERS",
            Hive::CurrentConfig => "HKEY_CURRENT_CONFIG",
        }
    }

    /// Resolve a hive from its textual name (case-insensitive).
    pub fn from_name(name: &str) -> Option<Hive> {
        const ALL: [Hive; 5] = [
            Hive::ClassesRoot,
            Hive::CurrentUser,
            Hive::LocalMachine,
            Hive::Users,
            Hive::CurrentConfig,
        ];
        ALL.into_iter()
            .find(|h| h.name().eq_ignore_ascii_case(name))
    }

    /// The underlying winreg handle for this hive.
    #[cfg(windows)]
    pub fn as_hkey(&self) -> winreg::HKEY {
        use winreg::enums::*;
        match self {
            Hive::ClassesRoot => HKEY_CLASSES_ROOT,
            Hive::CurrentUser => HKEY_CURRENT_USER,
            Hive::LocalMachine => HKEY_LOCAL_MACHINE,
            Hive::Users => HKEY_USERS,
            Hive::CurrentConfig => HKEY_CURRENT_CONFIG,
        }
    }
}

impl fmt::Display for Hive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A parsed registry path: hive plus optional sub-path.
///
/// `subpath` is `None` when the textual path named only the hive itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryPath {
    pub hive: Hive,
    pub subpath: Option<String>,
}

impl RegistryPath {
    /// Build a path directly from a hive and sub-path.
    pub fn new(hive: Hive, subpath: impl Into<String>) -> Self {
        let subpath = subpath.into();
        RegistryPath {
            hive,
            subpath: if subpath.is_empty() {
                None
            } else {
                Some(subpath)
            },
        }
    }

    /// Parse a `[Computer\]<HIVE>[\<subpath...>]` string.
    ///
    /// Returns [`RegistryError::UnresolvablePath`] when the first
    /// non-"Computer" segment is not a known hive name. Callers performing
    /// deletions treat that as "no such key" rather than a fault.
    pub fn parse(path: &str) -> Result<RegistryPath, RegistryError> {
        let trimmed = path.trim().trim_matches('\\');
        let mut rest = trimmed;

        if let Some((first, tail)) = rest.split_once('\\') {
            if first.eq_ignore_ascii_case("Computer") {
                rest = tail;
            }
        }

        let (hive_name, subpath) = match rest.split_once('\\') {
            Some((h, s)) => (h, Some(s)),
            None => (rest, None),
        };

        let hive = Hive::from_name(hive_name)
            .ok_or_else(|| RegistryError::UnresolvablePath(path.to_string()))?;

        Ok(RegistryPath {
            hive,
            subpath: subpath
                .map(|s| s.trim_matches('\\').to_string())
                .filter(|s| !s.is_empty()),
        })
    }

    /// Split into (parent key, leaf name).
    ///
    /// The leaf is the last path segment: the key to delete for key paths,
    /// or the value name for value paths. `None` when the path has no
    /// sub-path to split off.
    pub fn split_leaf(&self) -> Option<(RegistryPath, String)> {
        let subpath = self.subpath.as_deref()?;
        match subpath.rsplit_once('\\') {
            Some((parent, leaf)) => Some((
                RegistryPath {
                    hive: self.hive,
                    subpath: Some(parent.to_string()),
                },
                leaf.to_string(),
            )),
            None => Some((
                RegistryPath {
                    hive: self.hive,
                    subpath: None,
                },
                subpath.to_string(),
            )),
        }
    }

    /// Append a segment to the sub-path.
    pub fn join(&self, segment: &str) -> RegistryPath {
        let subpath = match &self.subpath {
            Some(s) => format!("{}\\{}", s, segment),
            None => segment.to_string(),
        };
        RegistryPath {
            hive: self.hive,
            subpath: Some(subpath),
        }
    }
}

impl fmt::Display for RegistryPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.subpath {
            Some(s) => write!(f, "{}\\{}", self.hive.name(), s),
            None => f.write_str(self.hive.name()),
        }
    }
}
