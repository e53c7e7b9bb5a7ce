//! Identity Resolver
//!
//! Determines the product identifier for each installation scope. The
//! installer writes a `SOFTWARE\{GUID}` key under the scope's root hive;
//! the GUID changes across product versions, so resolution is two-tier:
//! a fast probe of previously observed identifiers, then an exhaustive
//! scan of the `SOFTWARE` root matching the product's shortcut name.

use crate::product::{registry_key_name, TargetApp, SHORTCUT_NAME_VALUE};
use crate::regpath::{Hive, RegistryPath};
use crate::registry::RegistryOps;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Installation scope: machine-wide or current-user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scope {
    /// All-users installation (`HKEY_LOCAL_MACHINE`).
    Machine,
    /// Current-user installation (`HKEY_CURRENT_USER`).
    User,
}

impl Scope {
    pub const ALL: [Scope; 2] = [Scope::Machine, Scope::User];

    /// The registry root hive for this scope.
    pub fn hive(&self) -> Hive {
        match self {
            Scope::Machine => Hive::LocalMachine,
            Scope::User => Hive::CurrentUser,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Machine => f.write_str("all-users"),
            Scope::User => f.write_str("current-user"),
        }
    }
}

/// The product key path for an identifier under a scope's root:
/// `<root>\SOFTWARE\{GUID}`.
pub fn product_key(scope: Scope, id: &Uuid) -> RegistryPath {
    RegistryPath::new(scope.hive(), format!(r"SOFTWARE\{}", registry_key_name(id)))
}

/// Resolve the confirmed identifier for one scope, or `None` when the
/// scope has no confirmed installation.
///
/// Registry faults during resolution are logged and treated as
/// "not confirmed"; identity resolution never aborts the caller.
pub fn resolve_identifier(reg: &dyn RegistryOps, app: &TargetApp, scope: Scope) -> Option<Uuid> {
    // Tier 1: previously observed identifiers, in order.
    for id in app.known_ids() {
        let key = product_key(scope, id);
        match reg.key_exists(&key) {
            Ok(true) => {
                log::debug!("{} identifier {} confirmed via known list", scope, id);
                return Some(*id);
            }
            Ok(false) => {}
            Err(e) => log::warn!("probe of {} failed: {}", key, e),
        }
    }

    // Tier 2: exhaustive child scan of the scope's SOFTWARE root.
    scan_software_root(reg, app, scope)
}

/// Enumerate direct children of `<root>\SOFTWARE`, keep names that parse
/// as identifiers, and confirm the first whose shortcut-name attribute
/// equals the product's display name.
fn scan_software_root(reg: &dyn RegistryOps, app: &TargetApp, scope: Scope) -> Option<Uuid> {
    let root = RegistryPath::new(scope.hive(), "SOFTWARE");
    let children = match reg.list_child_names(&root) {
        Ok(Some(names)) => names,
        Ok(None) => return None,
        Err(e) => {
            log::warn!("scan of {} failed: {}", root, e);
            return None;
        }
    };

    for name in children {
        let Ok(id) = Uuid::parse_str(&name) else {
            continue;
        };
        let key = root.join(&name);
        match reg.read_string_value(&key, SHORTCUT_NAME_VALUE) {
            Ok(Some(shortcut)) if shortcut == app.display_name => {
                log::debug!("{} identifier {} confirmed via registry scan", scope, id);
                return Some(id);
            }
            Ok(_) => {}
            Err(e) => log::warn!("attribute read of {} failed: {}", key, e),
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MemRegistry;

    fn app() -> TargetApp {
        TargetApp::nimbus_sync()
    }

    #[test]
    fn test_known_identifier_confirmed() {
        let reg = MemRegistry::new();
        let app = app();
        let second = app.known_ids()[1];
        reg.set_key(&format!(
            r"HKEY_LOCAL_MACHINE\SOFTWARE\{}",
            registry_key_name(&second)
        ));

        let resolved = resolve_identifier(&reg, &app, Scope::Machine);
        assert_eq!(resolved, Some(second));
        // The other scope stays unconfirmed.
        assert_eq!(resolve_identifier(&reg, &app, Scope::User), None);
    }

    #[test]
    fn test_fallback_scan_confirms_unlisted_identifier() {
        // Known list contains A and B; the actual install wrote C.
        let reg = MemRegistry::new();
        let app = app();
        let actual = "{D4B8F1A0-3C5E-47D2-9E6B-812F4C0A7D55}";
        reg.set_value(
            &format!(r"HKEY_CURRENT_USER\SOFTWARE\{}", actual),
            SHORTCUT_NAME_VALUE,
            "Nimbus Sync",
        );
        // Noise: a GUID-named key belonging to someone else, and a
        // non-GUID vendor key.
        reg.set_value(
            r"HKEY_CURRENT_USER\SOFTWARE\{00000000-1111-2222-3333-444444444444}",
            SHORTCUT_NAME_VALUE,
            "Other Product",
        );
        reg.set_key(r"HKEY_CURRENT_USER\SOFTWARE\Microsoft");

        let resolved = resolve_identifier(&reg, &app, Scope::User);
        assert_eq!(resolved, Some(Uuid::parse_str(actual).unwrap()));
    }

    #[test]
    fn test_known_list_wins_over_scan() {
        let reg = MemRegistry::new();
        let app = app();
        let known = app.known_ids()[0];
        reg.set_key(&format!(
            r"HKEY_CURRENT_USER\SOFTWARE\{}",
            registry_key_name(&known)
        ));
        reg.set_value(
            r"HKEY_CURRENT_USER\SOFTWARE\{D4B8F1A0-3C5E-47D2-9E6B-812F4C0A7D55}",
            SHORTCUT_NAME_VALUE,
            "Nimbus Sync",
        );

        assert_eq!(resolve_identifier(&reg, &app, Scope::User), Some(known));
    }

    #[test]
    fn test_no_installation_stays_unconfirmed() {
        let reg = MemRegistry::new();
        reg.set_key(r"HKEY_CURRENT_USER\SOFTWARE\SomethingElse");
        assert_eq!(resolve_identifier(&reg, &app(), Scope::User), None);
        assert_eq!(resolve_identifier(&reg, &app(), Scope::Machine), None);
    }

    #[test]
    fn test_guid_key_without_matching_shortcut_not_confirmed() {
        let reg = MemRegistry::new();
        // GUID-named key with the wrong shortcut name, and one with no
        // shortcut attribute at all.
        reg.set_value(
            r"HKEY_LOCAL_MACHINE\SOFTWARE\{AAAAAAAA-BBBB-CCCC-DDDD-EEEEEEEEEEEE}",
            SHORTCUT_NAME_VALUE,
            "Not Nimbus",
        );
        reg.set_key(r"HKEY_LOCAL_MACHINE\SOFTWARE\{12121212-3434-5656-7878-909090909090}");
        assert_eq!(resolve_identifier(&reg, &app(), Scope::Machine), None);
    }
}
