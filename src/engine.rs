//! Uninstall Orchestrator
//!
//! Sequences the whole removal as a linear state machine with
//! short-circuit failure exits:
//!
//! `CheckInstalled -> CheckRunning -> ResolveIdentity -> DeleteRegistry ->
//! DeleteFiles -> Done`
//!
//! Registry cleanup is driven by a fixed, ordered list of path templates
//! instantiated per scope. Every deletion is attempted independently and
//! failures are aggregated into a bitmask; the plan always runs to
//! completion. No destructive operation happens while the target process
//! is running, and the orchestrator itself never attempts to close it;
//! that is the caller's decision via the process guard.

use crate::identity::{resolve_identifier, Scope};
use crate::install_path::InstallPathResolver;
use crate::process_guard::{ProcessGuard, ProcessProbe};
use crate::product::{registry_key_name, TargetApp};
use crate::registry::{delete_key_by_path, delete_value_by_path, RegistryOps};
use serde::{Deserialize, Serialize};
use std::cell::OnceCell;
use std::fmt;
use std::fs;
use std::ops::{BitOr, BitOrAssign};
use std::path::PathBuf;
use std::time::Instant;
use uuid::Uuid;

/// Registry keys removed during cleanup, instantiated for both scopes.
/// Templates referencing `{id}` are skipped for a scope without a
/// confirmed identifier; scope-independent templates run either way.
/// Order is stable for reproducible progress.
pub const KEY_TEMPLATES: &[&str] = &[
    r"Computer\{root}\SOFTWARE\{id}",
    r"Computer\{root}\SOFTWARE\Microsoft\Windows\CurrentVersion\Uninstall\{id}",
    r"Computer\{root}\SOFTWARE\Nimbus Labs\Nimbus Sync",
];

/// Registry values removed during cleanup (last segment is the value
/// name).
pub const VALUE_TEMPLATES: &[&str] = &[
    r"Computer\{root}\SOFTWARE\Microsoft\Windows\CurrentVersion\Run\Nimbus Sync",
];

/// Independent failure categories; any combination may be set on a
/// completed-but-imperfect run. Empty means complete success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResultFlags(u32);

impl ResultFlags {
    /// Target process detected; uninstall aborted before any mutation.
    pub const APPLICATION_OPEN: ResultFlags = ResultFlags(1);
    /// Installation appears present but no identifier could be confirmed.
    pub const IDENTIFIER_NOT_FOUND: ResultFlags = ResultFlags(1 << 1);
    /// Identifier confirmed for a scope but no install path resolvable;
    /// file deletion for that scope was skipped.
    pub const PATH_NOT_FOUND: ResultFlags = ResultFlags(1 << 2);
    /// An install directory still exists after the delete attempt.
    pub const FILES_NOT_DELETED: ResultFlags = ResultFlags(1 << 3);
    /// At least one registry entry in the plan raised a fault during
    /// deletion.
    pub const CANT_DELETE_KEY: ResultFlags = ResultFlags(1 << 4);

    pub fn empty() -> Self {
        ResultFlags(0)
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn contains(&self, other: ResultFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: ResultFlags) {
        self.0 |= other.0;
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    /// Human-readable names of the set flags.
    pub fn names(&self) -> Vec<&'static str> {
        const TABLE: [(ResultFlags, &str); 5] = [
            (ResultFlags::APPLICATION_OPEN, "ApplicationOpen"),
            (ResultFlags::IDENTIFIER_NOT_FOUND, "IdentifierNotFound"),
            (ResultFlags::PATH_NOT_FOUND, "PathNotFound"),
            (ResultFlags::FILES_NOT_DELETED, "FilesNotDeleted"),
            (ResultFlags::CANT_DELETE_KEY, "CantDeleteKey"),
        ];
        TABLE
            .into_iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| name)
            .collect()
    }
}

impl BitOr for ResultFlags {
    type Output = ResultFlags;
    fn bitor(self, rhs: ResultFlags) -> ResultFlags {
        ResultFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for ResultFlags {
    fn bitor_assign(&mut self, rhs: ResultFlags) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for ResultFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            f.write_str("none")
        } else {
            f.write_str(&self.names().join("|"))
        }
    }
}

/// Outcome of an uninstall run.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UninstallReport {
    /// No installation was found; the run exited before any mutation.
    /// A legitimate terminal state, distinct from both success and
    /// failure.
    pub not_installed: bool,
    /// Aggregate failure flags; empty means complete success.
    pub flags: ResultFlags,
    /// Names of the set failure flags, for readable output.
    pub failures: Vec<String>,
    /// Registry keys deleted (or confirmed already gone).
    pub keys_deleted: usize,
    /// Registry key deletions that faulted.
    pub keys_failed: usize,
    /// Registry values deleted (or confirmed already gone).
    pub values_deleted: usize,
    /// Registry value deletions that faulted.
    pub values_failed: usize,
    /// Install directories removed from disk.
    pub dirs_removed: usize,
    /// Per-item error descriptions.
    pub errors: Vec<String>,
    /// Wall-clock duration of the run in milliseconds.
    pub duration_ms: u128,
}

impl UninstallReport {
    /// Complete success: every attempted operation went through.
    pub fn success(&self) -> bool {
        self.flags.is_empty()
    }
}

impl fmt::Display for UninstallReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Uninstall Report")?;
        writeln!(f, "================")?;
        if self.not_installed {
            writeln!(f, "No installation found.")?;
            return Ok(());
        }
        writeln!(f, "Result: {}", self.flags)?;
        writeln!(f, "Registry Keys Deleted: {}", self.keys_deleted)?;
        writeln!(f, "Registry Keys Failed: {}", self.keys_failed)?;
        writeln!(f, "Registry Values Deleted: {}", self.values_deleted)?;
        writeln!(f, "Registry Values Failed: {}", self.values_failed)?;
        writeln!(f, "Directories Removed: {}", self.dirs_removed)?;
        writeln!(f, "Duration: {} ms", self.duration_ms)?;

        if !self.errors.is_empty() {
            writeln!(f, "\nErrors:")?;
            for error in &self.errors {
                writeln!(f, "  - {}", error)?;
            }
        }
        Ok(())
    }
}

/// Substitution context for one scope's pass over the template lists.
#[derive(Debug, Clone)]
struct PlanContext {
    root: String,
    id: Option<String>,
    sid: Option<String>,
    machine_path: Option<String>,
    user_path: Option<String>,
}

/// Instantiate a template against a context. `None` when the template
/// references a placeholder the context cannot supply; such entries are
/// skipped, not failed.
fn instantiate(template: &str, ctx: &PlanContext) -> Option<String> {
    let substitutions: [(&str, Option<&str>); 5] = [
        ("{root}", Some(ctx.root.as_str())),
        ("{id}", ctx.id.as_deref()),
        ("{sid}", ctx.sid.as_deref()),
        ("{machine_path}", ctx.machine_path.as_deref()),
        ("{user_path}", ctx.user_path.as_deref()),
    ];
    let mut out = template.to_string();
    for (token, value) in substitutions {
        if out.contains(token) {
            out = out.replace(token, value?);
        }
    }
    Some(out)
}

/// Progress listener: `(percent 0-100, phase description)`. Pushed at
/// each phase boundary; the final push always carries 100.
pub type ProgressFn = Box<dyn FnMut(u8, &str)>;

/// The uninstall engine. One instance per run; identifier and path
/// caches live for the lifetime of the instance.
pub struct Engine<R: RegistryOps, P: ProcessProbe> {
    app: TargetApp,
    registry: R,
    guard: ProcessGuard<P>,
    paths: InstallPathResolver,
    owner_sid: Option<String>,
    progress: Option<ProgressFn>,
    machine_id: OnceCell<Option<Uuid>>,
    user_id: OnceCell<Option<Uuid>>,
    machine_path: OnceCell<Option<PathBuf>>,
    user_path: OnceCell<Option<PathBuf>>,
}

impl<R: RegistryOps, P: ProcessProbe> Engine<R, P> {
    pub fn new(app: TargetApp, registry: R, probe: P, paths: InstallPathResolver) -> Self {
        let guard = ProcessGuard::new(probe, &app);
        Engine {
            app,
            registry,
            guard,
            paths,
            owner_sid: None,
            progress: None,
            machine_id: OnceCell::new(),
            user_id: OnceCell::new(),
            machine_path: OnceCell::new(),
            user_path: OnceCell::new(),
        }
    }

    /// Install a progress listener. Listeners must not block for a
    /// perceptible duration.
    #[must_use]
    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Supply the owning user's SID for templates that address
    /// `HKEY_USERS\<SID>` paths.
    #[must_use]
    pub fn with_owner_sid(mut self, sid: impl Into<String>) -> Self {
        self.owner_sid = Some(sid.into());
        self
    }

    /// The process guard, for the caller's own close/retry loop.
    pub fn guard(&self) -> &ProcessGuard<P> {
        &self.guard
    }

    /// The confirmed identifier for a scope, resolved once and cached.
    pub fn identifier(&self, scope: Scope) -> Option<Uuid> {
        let cell = match scope {
            Scope::Machine => &self.machine_id,
            Scope::User => &self.user_id,
        };
        *cell.get_or_init(|| resolve_identifier(&self.registry, &self.app, scope))
    }

    /// The install directory for a scope, resolved once and cached.
    pub fn install_path(&self, scope: Scope) -> Option<PathBuf> {
        let cell = match scope {
            Scope::Machine => &self.machine_path,
            Scope::User => &self.user_path,
        };
        cell.get_or_init(|| {
            let id = self.identifier(scope);
            self.paths.resolve(&self.registry, scope, id.as_ref())
        })
        .clone()
    }

    /// Whether an installation is present in either scope: a resolvable
    /// install path or a confirmed identifier counts.
    pub fn is_installed(&self) -> bool {
        Scope::ALL
            .iter()
            .any(|s| self.install_path(*s).is_some() || self.identifier(*s).is_some())
    }

    fn emit(&mut self, percent: u8, message: &str) {
        log::debug!("[{:>3}%] {}", percent, message);
        if let Some(cb) = &mut self.progress {
            cb(percent, message);
        }
    }

    /// Run the uninstall sequence to completion and report the aggregate
    /// outcome. Never returns `Err` for expected conditions; partial
    /// failures are flags in the report.
    pub fn uninstall(&mut self) -> UninstallReport {
        let started = Instant::now();
        let mut report = UninstallReport::default();

        self.emit(0, "Checking for an installation");
        if !self.is_installed() {
            report.not_installed = true;
            report.duration_ms = started.elapsed().as_millis();
            self.emit(100, "No installation found.");
            return report;
        }

        let check_msg = format!("Checking whether {} is running", self.app.display_name);
        self.emit(10, &check_msg);
        if self.guard.is_running() {
            report.flags.insert(ResultFlags::APPLICATION_OPEN);
            return self.finish(report, started);
        }

        self.emit(20, "Resolving product identifiers");
        let machine_id = self.identifier(Scope::Machine);
        let user_id = self.identifier(Scope::User);
        if machine_id.is_none() && user_id.is_none() {
            report.flags.insert(ResultFlags::IDENTIFIER_NOT_FOUND);
            return self.finish(report, started);
        }

        self.emit(30, "Removing registry entries");
        self.delete_registry(&mut report);

        self.emit(70, "Removing installed files");
        self.delete_files(&mut report);

        self.finish(report, started)
    }

    fn finish(&mut self, mut report: UninstallReport, started: Instant) -> UninstallReport {
        report.failures = report.flags.names().iter().map(|s| s.to_string()).collect();
        report.duration_ms = started.elapsed().as_millis();
        let summary = if report.success() {
            "Uninstall complete.".to_string()
        } else {
            format!("Uninstall finished with issues: {}", report.flags)
        };
        self.emit(100, &summary);
        report
    }

    fn plan_context(&self, scope: Scope) -> PlanContext {
        PlanContext {
            root: scope.hive().name().to_string(),
            id: self.identifier(scope).map(|id| registry_key_name(&id)),
            sid: self.owner_sid.clone(),
            machine_path: self
                .install_path(Scope::Machine)
                .map(|p| p.display().to_string()),
            user_path: self
                .install_path(Scope::User)
                .map(|p| p.display().to_string()),
        }
    }

    /// Execute the key-template list, then the value-template list, each
    /// template instantiated for both scopes independently. A scope
    /// without a confirmed identifier still gets its scope-independent
    /// entries attempted; only its `{id}` templates are skipped. Per-path
    /// faults set `CANT_DELETE_KEY` and the plan keeps going.
    fn delete_registry(&mut self, report: &mut UninstallReport) {
        let contexts: Vec<PlanContext> = Scope::ALL
            .iter()
            .map(|scope| self.plan_context(*scope))
            .collect();

        for template in KEY_TEMPLATES {
            for ctx in &contexts {
                let Some(path) = instantiate(template, ctx) else {
                    continue;
                };
                match delete_key_by_path(&self.registry, &path) {
                    Ok(()) => {
                        log::debug!("deleted key {}", path);
                        report.keys_deleted += 1;
                    }
                    Err(e) => {
                        log::warn!("failed to delete key {}: {}", path, e);
                        report.keys_failed += 1;
                        report.flags.insert(ResultFlags::CANT_DELETE_KEY);
                        report.errors.push(format!("{}: {}", path, e));
                    }
                }
            }
        }

        for template in VALUE_TEMPLATES {
            for ctx in &contexts {
                let Some(path) = instantiate(template, ctx) else {
                    continue;
                };
                match delete_value_by_path(&self.registry, &path) {
                    Ok(()) => {
                        log::debug!("deleted value {}", path);
                        report.values_deleted += 1;
                    }
                    Err(e) => {
                        log::warn!("failed to delete value {}: {}", path, e);
                        report.values_failed += 1;
                        report.flags.insert(ResultFlags::CANT_DELETE_KEY);
                        report.errors.push(format!("{}: {}", path, e));
                    }
                }
            }
        }
    }

    /// Recursively delete each scope's install tree, then re-check
    /// existence: anything still on disk sets `FILES_NOT_DELETED`. A
    /// scope without a confirmed identifier was never installed and is
    /// silently skipped; a confirmed scope without a resolvable path
    /// sets the soft `PATH_NOT_FOUND` flag.
    fn delete_files(&mut self, report: &mut UninstallReport) {
        let mut attempted = Vec::new();

        for scope in Scope::ALL {
            if self.identifier(scope).is_none() {
                continue;
            }
            let Some(path) = self.install_path(scope) else {
                log::debug!("{} scope has no resolvable install path", scope);
                report.flags.insert(ResultFlags::PATH_NOT_FOUND);
                continue;
            };
            if path.exists() {
                match fs::remove_dir_all(&path) {
                    Ok(()) => {
                        log::debug!("removed {}", path.display());
                        report.dirs_removed += 1;
                    }
                    Err(e) => {
                        log::warn!("failed to remove {}: {}", path.display(), e);
                        report.errors.push(format!("{}: {}", path.display(), e));
                    }
                }
            }
            attempted.push(path);
        }

        for path in attempted {
            if path.exists() {
                report.flags.insert(ResultFlags::FILES_NOT_DELETED);
            }
        }
    }
}

/// Instantiated paths of the full deletion plan for the given scopes, in
/// plan order. Exposed for reporting and verification.
pub fn plan_paths(
    scopes: &[(Scope, Uuid)],
    machine_path: Option<&str>,
    user_path: Option<&str>,
) -> Vec<String> {
    let mut out = Vec::new();
    let contexts: Vec<PlanContext> = scopes
        .iter()
        .map(|(scope, id)| PlanContext {
            root: scope.hive().name().to_string(),
            id: Some(registry_key_name(id)),
            sid: None,
            machine_path: machine_path.map(str::to_string),
            user_path: user_path.map(str::to_string),
        })
        .collect();
    for template in KEY_TEMPLATES.iter().chain(VALUE_TEMPLATES) {
        for ctx in &contexts {
            if let Some(path) = instantiate(template, ctx) {
                out.push(path);
            }
        }
    }
    out
}
