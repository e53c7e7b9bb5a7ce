//! Registry Accessor
//!
//! A narrow capability surface over the Windows registry: existence checks,
//! child enumeration, string value reads, and idempotent deletes of keys
//! (with their subtree) and values. Deleting something that does not exist
//! is success; only a fault during the attempt itself is an error.
//!
//! The [`RegistryOps`] trait is the seam between the uninstall engine and
//! the OS. [`WindowsRegistry`] is the `winreg`-backed production
//! implementation; [`MemRegistry`] is an in-memory implementation used by
//! the test suite and by builds on non-Windows hosts.

use crate::regpath::RegistryPath;
use std::collections::{BTreeMap, HashSet};
use std::io;
use std::sync::Mutex;
use thiserror::Error;

/// Error raised by a single registry operation.
///
/// These never abort the deletion plan; the orchestrator folds them into
/// its aggregate result flags.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The textual path did not name a known hive.
    #[error("unresolvable registry path: {0}")]
    UnresolvablePath(String),

    /// The OS refused access to the key.
    #[error("access denied: {0}")]
    Denied(String),

    /// Any other OS-level fault.
    #[error("registry operation failed on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

/// Which WOW64 view of the registry to address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegistryView {
    /// The process-native view.
    #[default]
    Default,
    /// Force the 64-bit view (`KEY_WOW64_64KEY`).
    Force64,
    /// Force the 32-bit view (`KEY_WOW64_32KEY`).
    Force32,
}

/// Capability interface over the registry.
///
/// Everything the identity resolver, path resolver, and deletion plan need,
/// and nothing more, so all three can be tested against [`MemRegistry`].
pub trait RegistryOps {
    /// Whether the key exists. A bare hive always exists.
    fn key_exists(&self, path: &RegistryPath) -> Result<bool, RegistryError>;

    /// Direct child key names, or `None` if the key itself is absent.
    fn list_child_names(&self, path: &RegistryPath) -> Result<Option<Vec<String>>, RegistryError>;

    /// Read a string value under the key. `None` when the key or the value
    /// is absent.
    fn read_string_value(
        &self,
        key: &RegistryPath,
        name: &str,
    ) -> Result<Option<String>, RegistryError>;

    /// Delete the key and its entire subtree. Absence is success.
    fn delete_key(&self, path: &RegistryPath) -> Result<(), RegistryError>;

    /// Delete one named value under the key. Absence of the key or the
    /// value is success.
    fn delete_value(&self, key: &RegistryPath, name: &str) -> Result<(), RegistryError>;
}

impl<T: RegistryOps + ?Sized> RegistryOps for &T {
    fn key_exists(&self, path: &RegistryPath) -> Result<bool, RegistryError> {
        (**self).key_exists(path)
    }
    fn list_child_names(&self, path: &RegistryPath) -> Result<Option<Vec<String>>, RegistryError> {
        (**self).list_child_names(path)
    }
    fn read_string_value(
        &self,
        key: &RegistryPath,
        name: &str,
    ) -> Result<Option<String>, RegistryError> {
        (**self).read_string_value(key, name)
    }
    fn delete_key(&self, path: &RegistryPath) -> Result<(), RegistryError> {
        (**self).delete_key(path)
    }
    fn delete_value(&self, key: &RegistryPath, name: &str) -> Result<(), RegistryError> {
        (**self).delete_value(key, name)
    }
}

/// Delete the key named by a full textual path.
///
/// An unresolvable path is treated as "no such key" (success), matching the
/// idempotent delete contract.
pub fn delete_key_by_path(reg: &dyn RegistryOps, path: &str) -> Result<(), RegistryError> {
    let parsed = match RegistryPath::parse(path) {
        Ok(p) => p,
        Err(RegistryError::UnresolvablePath(_)) => {
            log::debug!("skipping unresolvable key path: {}", path);
            return Ok(());
        }
        Err(e) => return Err(e),
    };
    reg.delete_key(&parsed)
}

/// Delete the value named by a full textual path, where the last path
/// segment is the value name and the rest names its parent key.
pub fn delete_value_by_path(reg: &dyn RegistryOps, path: &str) -> Result<(), RegistryError> {
    let parsed = match RegistryPath::parse(path) {
        Ok(p) => p,
        Err(RegistryError::UnresolvablePath(_)) => {
            log::debug!("skipping unresolvable value path: {}", path);
            return Ok(());
        }
        Err(e) => return Err(e),
    };
    let Some((parent, value_name)) = parsed.split_leaf() else {
        // A bare hive carries no deletable value.
        return Ok(());
    };
    reg.delete_value(&parent, &value_name)
}

#[cfg(windows)]
fn map_io(path: &RegistryPath, source: io::Error) -> RegistryError {
    if source.kind() == io::ErrorKind::PermissionDenied {
        RegistryError::Denied(path.to_string())
    } else {
        RegistryError::Io {
            path: path.to_string(),
            source,
        }
    }
}

/// Production accessor backed by the live Windows registry.
#[cfg(windows)]
#[derive(Debug, Default, Clone)]
pub struct WindowsRegistry {
    view: RegistryView,
}

#[cfg(windows)]
impl WindowsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Address a specific WOW64 registry view.
    #[must_use]
    pub fn with_view(view: RegistryView) -> Self {
        WindowsRegistry { view }
    }

    fn sam(&self, base: u32) -> u32 {
        use winreg::enums::{KEY_WOW64_32KEY, KEY_WOW64_64KEY};
        match self.view {
            RegistryView::Default => base,
            RegistryView::Force64 => base | KEY_WOW64_64KEY,
            RegistryView::Force32 => base | KEY_WOW64_32KEY,
        }
    }

    /// Open a key read-only. `None` when any segment along the way is
    /// absent.
    fn open_readable(&self, path: &RegistryPath) -> Result<Option<winreg::RegKey>, RegistryError> {
        use winreg::enums::KEY_READ;
        let root = winreg::RegKey::predef(path.hive.as_hkey());
        match &path.subpath {
            None => Ok(Some(root)),
            Some(sub) => match root.open_subkey_with_flags(sub, self.sam(KEY_READ)) {
                Ok(key) => Ok(Some(key)),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(map_io(path, e)),
            },
        }
    }
}

#[cfg(windows)]
impl RegistryOps for WindowsRegistry {
    fn key_exists(&self, path: &RegistryPath) -> Result<bool, RegistryError> {
        Ok(self.open_readable(path)?.is_some())
    }

    fn list_child_names(&self, path: &RegistryPath) -> Result<Option<Vec<String>>, RegistryError> {
        let Some(key) = self.open_readable(path)? else {
            return Ok(None);
        };
        let mut names = Vec::new();
        for name in key.enum_keys() {
            match name {
                Ok(n) => names.push(n),
                Err(e) => return Err(map_io(path, e)),
            }
        }
        Ok(Some(names))
    }

    fn read_string_value(
        &self,
        key: &RegistryPath,
        name: &str,
    ) -> Result<Option<String>, RegistryError> {
        let Some(reg_key) = self.open_readable(key)? else {
            return Ok(None);
        };
        match reg_key.get_value::<String, _>(name) {
            Ok(v) => Ok(Some(v)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(map_io(key, e)),
        }
    }

    fn delete_key(&self, path: &RegistryPath) -> Result<(), RegistryError> {
        use winreg::enums::{KEY_READ, KEY_WRITE};
        // A bare hive cannot be deleted.
        let Some((parent, leaf)) = path.split_leaf() else {
            return Err(RegistryError::UnresolvablePath(path.to_string()));
        };
        let root = winreg::RegKey::predef(parent.hive.as_hkey());
        let parent_key = match &parent.subpath {
            None => root,
            Some(sub) => match root.open_subkey_with_flags(sub, self.sam(KEY_READ | KEY_WRITE)) {
                Ok(key) => key,
                // Parent already gone means the key is gone too.
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
                Err(e) => return Err(map_io(path, e)),
            },
        };
        match parent_key.delete_subkey_all(&leaf) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(map_io(path, e)),
        }
    }

    fn delete_value(&self, key: &RegistryPath, name: &str) -> Result<(), RegistryError> {
        use winreg::enums::{KEY_READ, KEY_WRITE};
        let root = winreg::RegKey::predef(key.hive.as_hkey());
        let reg_key = match &key.subpath {
            None => root,
            Some(sub) => match root.open_subkey_with_flags(sub, self.sam(KEY_READ | KEY_WRITE)) {
                Ok(k) => k,
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
                Err(e) => return Err(map_io(key, e)),
            },
        };
        // Only delete when present; absence is success.
        match reg_key.get_raw_value(name) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(map_io(key, e)),
        }
        match reg_key.delete_value(name) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(map_io(key, e)),
        }
    }
}

#[derive(Debug, Default)]
struct MemKey {
    /// Display form of the key's own name (last path segment).
    name: String,
    /// Value name (normalized) -> (display name, data).
    values: BTreeMap<String, (String, String)>,
}

#[derive(Debug, Default)]
struct MemInner {
    /// Normalized full path -> key.
    keys: BTreeMap<String, MemKey>,
    /// Normalized paths on which delete attempts fail with access denied.
    denied: HashSet<String>,
}

/// In-memory registry.
///
/// Backs the test suite and non-Windows builds. Paths are compared
/// case-insensitively, like the real registry. Delete attempts on paths
/// registered via [`MemRegistry::deny`] fail with
/// [`RegistryError::Denied`], which is how the tests simulate permission
/// denial on a single entry of the deletion plan.
#[derive(Debug, Default)]
pub struct MemRegistry {
    inner: Mutex<MemInner>,
}

fn normalize(path: &RegistryPath) -> String {
    path.to_string().to_ascii_lowercase()
}

impl MemRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a key (and its implicit parents). Fixture builder; panics on
    /// a malformed path.
    pub fn set_key(&self, path: &str) {
        let parsed = RegistryPath::parse(path).expect("valid registry path");
        let mut inner = self.inner.lock().unwrap();
        Self::insert_chain(&mut inner, &parsed);
    }

    /// Create a key and set a string value on it.
    pub fn set_value(&self, path: &str, name: &str, data: &str) {
        let parsed = RegistryPath::parse(path).expect("valid registry path");
        let mut inner = self.inner.lock().unwrap();
        Self::insert_chain(&mut inner, &parsed);
        let norm = normalize(&parsed);
        inner
            .keys
            .get_mut(&norm)
            .expect("key just inserted")
            .values
            .insert(
                name.to_ascii_lowercase(),
                (name.to_string(), data.to_string()),
            );
    }

    /// Make every delete attempt on this exact path fail with access
    /// denied.
    pub fn deny(&self, path: &str) {
        let parsed = RegistryPath::parse(path).expect("valid registry path");
        self.inner.lock().unwrap().denied.insert(normalize(&parsed));
    }

    /// All stored key paths, in normalized form. Used by tests asserting
    /// that a run performed no mutation.
    pub fn snapshot(&self) -> Vec<String> {
        self.inner.lock().unwrap().keys.keys().cloned().collect()
    }

    fn insert_chain(inner: &mut MemInner, path: &RegistryPath) {
        let Some(subpath) = &path.subpath else {
            return;
        };
        let mut accumulated = String::new();
        for segment in subpath.split('\\') {
            if !accumulated.is_empty() {
                accumulated.push('\\');
            }
            accumulated.push_str(segment);
            let key_path = RegistryPath::new(path.hive, accumulated.clone());
            inner
                .keys
                .entry(normalize(&key_path))
                .or_insert_with(|| MemKey {
                    name: segment.to_string(),
                    values: BTreeMap::new(),
                });
        }
    }
}

impl RegistryOps for MemRegistry {
    fn key_exists(&self, path: &RegistryPath) -> Result<bool, RegistryError> {
        if path.subpath.is_none() {
            return Ok(true);
        }
        let inner = self.inner.lock().unwrap();
        Ok(inner.keys.contains_key(&normalize(path)))
    }

    fn list_child_names(&self, path: &RegistryPath) -> Result<Option<Vec<String>>, RegistryError> {
        let inner = self.inner.lock().unwrap();
        let norm = normalize(path);
        if path.subpath.is_some() && !inner.keys.contains_key(&norm) {
            return Ok(None);
        }
        let prefix = format!("{}\\", norm);
        let names = inner
            .keys
            .iter()
            .filter(|(k, _)| k.starts_with(&prefix) && !k[prefix.len()..].contains('\\'))
            .map(|(_, key)| key.name.clone())
            .collect();
        Ok(Some(names))
    }

    fn read_string_value(
        &self,
        key: &RegistryPath,
        name: &str,
    ) -> Result<Option<String>, RegistryError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .keys
            .get(&normalize(key))
            .and_then(|k| k.values.get(&name.to_ascii_lowercase()))
            .map(|(_, data)| data.clone()))
    }

    fn delete_key(&self, path: &RegistryPath) -> Result<(), RegistryError> {
        if path.subpath.is_none() {
            return Err(RegistryError::UnresolvablePath(path.to_string()));
        }
        let mut inner = self.inner.lock().unwrap();
        let norm = normalize(path);
        if inner.denied.contains(&norm) {
            return Err(RegistryError::Denied(path.to_string()));
        }
        let prefix = format!("{}\\", norm);
        inner
            .keys
            .retain(|k, _| k != &norm && !k.starts_with(&prefix));
        Ok(())
    }

    fn delete_value(&self, key: &RegistryPath, name: &str) -> Result<(), RegistryError> {
        let mut inner = self.inner.lock().unwrap();
        let norm = normalize(key);
        if inner.denied.contains(&norm) {
            return Err(RegistryError::Denied(key.to_string()));
        }
        if let Some(k) = inner.keys.get_mut(&norm) {
            k.values.remove(&name.to_ascii_lowercase());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_exists_and_children() {
        let reg = MemRegistry::new();
        reg.set_key(r"HKEY_CURRENT_USER\SOFTWARE\Vendor\App");

        let software = RegistryPath::parse(r"HKEY_CURRENT_USER\SOFTWARE").unwrap();
        assert!(reg.key_exists(&software).unwrap());

        let children = reg.list_child_names(&software).unwrap().unwrap();
        assert_eq!(children, vec!["Vendor".to_string()]);

        let missing = RegistryPath::parse(r"HKEY_CURRENT_USER\Nothing").unwrap();
        assert!(!reg.key_exists(&missing).unwrap());
        assert!(reg.list_child_names(&missing).unwrap().is_none());
    }

    #[test]
    fn test_hive_always_exists() {
        let reg = MemRegistry::new();
        let hive = RegistryPath::parse("HKEY_LOCAL_MACHINE").unwrap();
        assert!(reg.key_exists(&hive).unwrap());
    }

    #[test]
    fn test_case_insensitive_lookup() {
        let reg = MemRegistry::new();
        reg.set_value(r"HKEY_CURRENT_USER\SOFTWARE\Vendor", "Name", "data");
        let lower = RegistryPath::parse(r"hkey_current_user\software\vendor").unwrap();
        assert!(reg.key_exists(&lower).unwrap());
        assert_eq!(
            reg.read_string_value(&lower, "NAME").unwrap().as_deref(),
            Some("data")
        );
    }

    #[test]
    fn test_delete_key_removes_subtree() {
        let reg = MemRegistry::new();
        reg.set_key(r"HKEY_CURRENT_USER\SOFTWARE\Vendor\App\Sub");
        reg.set_key(r"HKEY_CURRENT_USER\SOFTWARE\Other");

        let vendor = RegistryPath::parse(r"HKEY_CURRENT_USER\SOFTWARE\Vendor").unwrap();
        reg.delete_key(&vendor).unwrap();

        assert!(!reg.key_exists(&vendor).unwrap());
        let app = RegistryPath::parse(r"HKEY_CURRENT_USER\SOFTWARE\Vendor\App").unwrap();
        assert!(!reg.key_exists(&app).unwrap());
        let other = RegistryPath::parse(r"HKEY_CURRENT_USER\SOFTWARE\Other").unwrap();
        assert!(reg.key_exists(&other).unwrap());
    }

    #[test]
    fn test_delete_absent_is_success() {
        let reg = MemRegistry::new();
        let path = RegistryPath::parse(r"HKEY_CURRENT_USER\SOFTWARE\Ghost").unwrap();
        assert!(reg.delete_key(&path).is_ok());
        assert!(reg.delete_value(&path, "Anything").is_ok());
    }

    #[test]
    fn test_denied_delete_fails() {
        let reg = MemRegistry::new();
        reg.set_key(r"HKEY_LOCAL_MACHINE\SOFTWARE\Locked");
        reg.deny(r"HKEY_LOCAL_MACHINE\SOFTWARE\Locked");

        let path = RegistryPath::parse(r"HKEY_LOCAL_MACHINE\SOFTWARE\Locked").unwrap();
        assert!(matches!(
            reg.delete_key(&path),
            Err(RegistryError::Denied(_))
        ));
        // Still present after the failed attempt.
        assert!(reg.key_exists(&path).unwrap());
    }

    #[test]
    fn test_delete_key_by_path_handles_bad_hive() {
        let reg = MemRegistry::new();
        // Unknown hive resolves to "no such key", not a fault.
        assert!(delete_key_by_path(&reg, r"HKEY_BOGUS\SOFTWARE\X").is_ok());
    }

    #[test]
    fn test_delete_value_by_path_splits_leaf() {
        let reg = MemRegistry::new();
        reg.set_value(
            r"HKEY_CURRENT_USER\SOFTWARE\Microsoft\Windows\CurrentVersion\Run",
            "Nimbus Sync",
            r"C:\Program Files\Nimbus Sync\NimbusSync.exe",
        );
        delete_value_by_path(
            &reg,
            r"Computer\HKEY_CURRENT_USER\SOFTWARE\Microsoft\Windows\CurrentVersion\Run\Nimbus Sync",
        )
        .unwrap();

        let run = RegistryPath::parse(
            r"HKEY_CURRENT_USER\SOFTWARE\Microsoft\Windows\CurrentVersion\Run",
        )
        .unwrap();
        assert!(reg
            .read_string_value(&run, "Nimbus Sync")
            .unwrap()
            .is_none());
        // The parent key itself survives.
        assert!(reg.key_exists(&run).unwrap());
    }
}
