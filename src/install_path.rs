//! Install Path Resolver
//!
//! Determines the on-disk install directory per scope. The conventional
//! location is checked first and wins whenever it exists: the filesystem
//! is ground truth for whether there is anything to delete. Only when the
//! conventional directory is absent does the resolver consult the
//! `InstallLocation` value of the confirmed product key (a custom install
//! path chosen in the installer).

use crate::identity::{product_key, Scope};
use crate::product::{TargetApp, INSTALL_LOCATION_VALUE};
use crate::registry::RegistryOps;
use std::env;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Per-scope install directory resolution.
///
/// The conventional base directories are constructor inputs so tests can
/// point them at temporary trees.
#[derive(Debug, Clone)]
pub struct InstallPathResolver {
    conventional_machine: PathBuf,
    conventional_user: PathBuf,
}

impl InstallPathResolver {
    /// Resolver using the OS-conventional install roots:
    /// `%ProgramFiles%\<product>` for the machine scope and
    /// `<local app data>\Programs\<product>` for the user scope.
    pub fn new(app: &TargetApp) -> Self {
        let program_files =
            env::var_os("ProgramFiles").map_or_else(|| PathBuf::from(r"C:\Program Files"), PathBuf::from);
        let user_programs = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from(r"C:\Users\Default\AppData\Local"))
            .join("Programs");
        Self::with_roots(app, &program_files, &user_programs)
    }

    /// Resolver with explicit conventional roots (the product directory
    /// name is appended to each).
    pub fn with_roots(app: &TargetApp, machine_root: &Path, user_root: &Path) -> Self {
        InstallPathResolver {
            conventional_machine: machine_root.join(&app.install_dir_name),
            conventional_user: user_root.join(&app.install_dir_name),
        }
    }

    /// The conventional directory for a scope, regardless of existence.
    pub fn conventional(&self, scope: Scope) -> &Path {
        match scope {
            Scope::Machine => &self.conventional_machine,
            Scope::User => &self.conventional_user,
        }
    }

    /// Resolve the install directory for a scope.
    ///
    /// `id` is the scope's confirmed identifier, if any; without one the
    /// registry fallback is unavailable. `None` means no path could be
    /// determined, which by itself is not an error.
    pub fn resolve(
        &self,
        reg: &dyn RegistryOps,
        scope: Scope,
        id: Option<&Uuid>,
    ) -> Option<PathBuf> {
        let conventional = self.conventional(scope);
        if conventional.is_dir() {
            log::debug!("{} install path found on disk: {}", scope, conventional.display());
            return Some(conventional.to_path_buf());
        }

        let id = id?;
        let key = product_key(scope, id);
        match reg.read_string_value(&key, INSTALL_LOCATION_VALUE) {
            Ok(Some(location)) if !location.trim().is_empty() => {
                let path = PathBuf::from(location.trim());
                log::debug!("{} install path from registry: {}", scope, path.display());
                Some(path)
            }
            Ok(_) => None,
            Err(e) => {
                log::warn!("install location read from {} failed: {}", key, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::product::registry_key_name;
    use crate::registry::MemRegistry;
    use tempfile::TempDir;

    fn setup() -> (TargetApp, TempDir, TempDir) {
        (
            TargetApp::nimbus_sync(),
            TempDir::new().unwrap(),
            TempDir::new().unwrap(),
        )
    }

    #[test]
    fn test_conventional_path_wins_over_registry() {
        let (app, machine_root, user_root) = setup();
        let resolver = InstallPathResolver::with_roots(&app, machine_root.path(), user_root.path());

        // Directory exists on disk at the conventional location...
        let on_disk = machine_root.path().join(&app.install_dir_name);
        std::fs::create_dir_all(&on_disk).unwrap();

        // ...while the registry claims somewhere else entirely.
        let reg = MemRegistry::new();
        let id = app.known_ids()[0];
        reg.set_value(
            &format!(r"HKEY_LOCAL_MACHINE\SOFTWARE\{}", registry_key_name(&id)),
            INSTALL_LOCATION_VALUE,
            r"D:\Custom\Nimbus",
        );

        let resolved = resolver.resolve(&reg, Scope::Machine, Some(&id));
        assert_eq!(resolved, Some(on_disk));
    }

    #[test]
    fn test_conventional_path_without_registry_entry() {
        let (app, machine_root, user_root) = setup();
        let resolver = InstallPathResolver::with_roots(&app, machine_root.path(), user_root.path());
        let on_disk = machine_root.path().join(&app.install_dir_name);
        std::fs::create_dir_all(&on_disk).unwrap();

        // No identifier, no registry entry: the filesystem alone decides.
        let reg = MemRegistry::new();
        assert_eq!(resolver.resolve(&reg, Scope::Machine, None), Some(on_disk));
    }

    #[test]
    fn test_registry_fallback_when_conventional_absent() {
        let (app, machine_root, user_root) = setup();
        let resolver = InstallPathResolver::with_roots(&app, machine_root.path(), user_root.path());

        let reg = MemRegistry::new();
        let id = app.known_ids()[0];
        reg.set_value(
            &format!(r"HKEY_CURRENT_USER\SOFTWARE\{}", registry_key_name(&id)),
            INSTALL_LOCATION_VALUE,
            r"D:\Apps\Nimbus Sync",
        );

        let resolved = resolver.resolve(&reg, Scope::User, Some(&id));
        assert_eq!(resolved, Some(PathBuf::from(r"D:\Apps\Nimbus Sync")));
    }

    #[test]
    fn test_no_sources_yields_none() {
        let (app, machine_root, user_root) = setup();
        let resolver = InstallPathResolver::with_roots(&app, machine_root.path(), user_root.path());
        let reg = MemRegistry::new();
        let id = app.known_ids()[0];

        assert_eq!(resolver.resolve(&reg, Scope::User, Some(&id)), None);
        assert_eq!(resolver.resolve(&reg, Scope::User, None), None);
    }

    #[test]
    fn test_blank_registry_location_ignored() {
        let (app, machine_root, user_root) = setup();
        let resolver = InstallPathResolver::with_roots(&app, machine_root.path(), user_root.path());
        let reg = MemRegistry::new();
        let id = app.known_ids()[0];
        reg.set_value(
            &format!(r"HKEY_CURRENT_USER\SOFTWARE\{}", registry_key_name(&id)),
            INSTALL_LOCATION_VALUE,
            "   ",
        );
        assert_eq!(resolver.resolve(&reg, Scope::User, Some(&id)), None);
    }
}
