//! Update check orchestration.
//!
//! The [`UpdateOrchestrator`] decides whether a check is due, enumerates
//! the installed units from disk, and drives each through its
//! [`Installer`]. Units run one at a time, extensions first, then themes,
//! then the core platform. A failing unit never stops the cycle.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use crate::config::UpdateConfig;
use crate::error::UpdateError;
use crate::install::{InstallLayout, InstallerSet, MANIFEST_FILE};
use crate::installer::{
    FailureReason, Installer, InstallerContext, Stage, StageFailure, UpdateOutcome,
};
use crate::package::{PackageIdentity, PackageKind};

/// One installed unit found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallableUnit {
    /// Unique label within one cycle
    pub key: String,
    pub identity: PackageIdentity,
    pub dir: PathBuf,
    pub current_version: Option<String>,
}

/// Outcome for one unit of a check cycle.
#[derive(Debug, Clone)]
pub struct UnitReport {
    pub unit: InstallableUnit,
    pub outcome: UpdateOutcome,
}

/// Outcomes of one check cycle, in processing order.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub units: Vec<UnitReport>,
}

impl CycleReport {
    pub fn installed(&self) -> usize {
        self.count(|o| matches!(o, UpdateOutcome::Installed(_)))
    }

    pub fn up_to_date(&self) -> usize {
        self.count(|o| matches!(o, UpdateOutcome::UpToDate { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, UpdateOutcome::Failed(_)))
    }

    fn count(&self, pred: impl Fn(&UpdateOutcome) -> bool) -> usize {
        self.units.iter().filter(|u| pred(&u.outcome)).count()
    }
}

/// Fields of a unit manifest the orchestrator reads.
#[derive(Debug, Default, Deserialize)]
struct UnitManifest {
    #[serde(default)]
    supplier: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    version: Option<String>,
}

/// Drives periodic update checks.
pub struct UpdateOrchestrator {
    config: UpdateConfig,
    ctx: InstallerContext,
    installers: InstallerSet,
    layout: InstallLayout,
    last_check_file: PathBuf,
}

impl UpdateOrchestrator {
    pub fn new(config: UpdateConfig, ctx: InstallerContext, installers: InstallerSet) -> Self {
        let layout = InstallLayout::new(config.paths.root.clone());
        let last_check_file = config.resolve(&config.paths.last_check_file);
        Self {
            config,
            ctx,
            installers,
            layout,
            last_check_file,
        }
    }

    /// Whether more than the configured interval has passed since the last
    /// recorded check. True when no check was ever recorded.
    pub fn needs_check(&self) -> bool {
        let last = match std::fs::read_to_string(&self.last_check_file) {
            Ok(content) => match content.trim().parse::<i64>() {
                Ok(last) => last,
                Err(_) => {
                    warn!("Ignoring unreadable last check time in {:?}", self.last_check_file);
                    return true;
                }
            },
            Err(_) => return true,
        };
        let interval = i64::try_from(self.config.check_interval().as_secs()).unwrap_or(i64::MAX);
        Utc::now().timestamp().saturating_sub(last) > interval
    }

    /// Record the current time as the last check.
    pub fn record_check(&self) -> Result<(), UpdateError> {
        if let Some(parent) = self.last_check_file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.last_check_file, Utc::now().timestamp().to_string())?;
        Ok(())
    }

    /// Enumerate installed units: extensions, then themes, then the core.
    ///
    /// Units whose manifest names no supplier are skipped.
    pub fn discover_units(&self) -> Result<Vec<InstallableUnit>, UpdateError> {
        let mut units = Vec::new();
        let mut keys = HashSet::new();

        for dir in subdirectories(&self.layout.extensions_root())? {
            let Some(manifest) = read_manifest(&dir) else {
                continue;
            };
            let Some(supplier) = manifest.supplier.filter(|s| !s.is_empty()) else {
                debug!("Skipping extension without supplier: {:?}", dir);
                continue;
            };
            let name = manifest.name.unwrap_or_else(|| end_piece(&dir));
            units.push(InstallableUnit {
                key: unique_key(&mut keys, &name),
                identity: PackageIdentity::new(PackageKind::Extension, supplier, name),
                dir,
                current_version: manifest.version,
            });
        }

        for supplier_dir in subdirectories(&self.layout.themes_root())? {
            for dir in subdirectories(&supplier_dir)? {
                let Some(manifest) = read_manifest(&dir) else {
                    continue;
                };
                let Some(supplier) = manifest.supplier.filter(|s| !s.is_empty()) else {
                    debug!("Skipping theme without supplier: {:?}", dir);
                    continue;
                };
                let name = manifest.name.unwrap_or_else(|| end_piece(&dir));
                units.push(InstallableUnit {
                    key: unique_key(&mut keys, &format!("{}.{}", supplier, name)),
                    identity: PackageIdentity::new(PackageKind::Theme, supplier, name),
                    dir,
                    current_version: manifest.version,
                });
            }
        }

        if !self.config.trusted_supplier.is_empty() {
            let dir = self.layout.core_dir();
            let current_version = read_manifest(&dir).and_then(|m| m.version);
            units.push(InstallableUnit {
                key: unique_key(&mut keys, "core"),
                identity: PackageIdentity::new(
                    PackageKind::Core,
                    self.config.trusted_supplier.clone(),
                    self.config.core_package.clone(),
                ),
                dir,
                current_version,
            });
        }

        debug!(
            units = ?units.iter().map(|u| u.key.as_str()).collect::<Vec<_>>(),
            "Discovered installable units"
        );
        Ok(units)
    }

    /// Run one check cycle if due (or if `force` is set).
    ///
    /// Returns `None` when no check was due.
    pub async fn run_check_cycle(&self, force: bool) -> Result<Option<CycleReport>, UpdateError> {
        if !force && !self.needs_check() {
            debug!("Update check not due");
            return Ok(None);
        }

        let units = self.discover_units()?;
        info!("Checking {} units for updates", units.len());

        let mut report = CycleReport::default();
        for unit in units {
            let outcome = self.update_unit(&unit).await;
            match &outcome {
                UpdateOutcome::Installed(r) => {
                    info!(unit = %unit.key, version = %r.version, "Unit updated")
                }
                UpdateOutcome::UpToDate { .. } => debug!(unit = %unit.key, "Unit up to date"),
                UpdateOutcome::Failed(f) => {
                    error!(unit = %unit.key, reason = %f.reason, "Unit update failed")
                }
            }
            report.units.push(UnitReport { unit, outcome });
        }

        self.record_check()?;
        info!(
            installed = report.installed(),
            up_to_date = report.up_to_date(),
            failed = report.failed(),
            "Update check complete"
        );
        Ok(Some(report))
    }

    async fn update_unit(&self, unit: &InstallableUnit) -> UpdateOutcome {
        let identity = &unit.identity;
        let Some(installable) = self.installers.get(identity.kind) else {
            return failed(format!("no installer for {}", identity.kind));
        };

        if let Err(e) = self
            .ctx
            .store
            .register(identity, unit.current_version.as_deref())
            .await
        {
            warn!(unit = %unit.key, error = %e, "Failed to register unit inventory");
        }

        match Installer::new(self.ctx.clone(), installable, &identity.supplier, &identity.name) {
            Ok(mut installer) => {
                installer.install_into(unit.dir.clone());
                installer.auto_update(unit.current_version.as_deref()).await
            }
            Err(e) => failed(e.to_string()),
        }
    }
}

fn failed(message: String) -> UpdateOutcome {
    UpdateOutcome::Failed(StageFailure {
        stage: Stage::Start,
        reason: FailureReason::Other(message),
    })
}

/// Subdirectories of `dir` sorted by path. A missing `dir` has none.
fn subdirectories(dir: &Path) -> Result<Vec<PathBuf>, UpdateError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut dirs = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.is_dir() {
            dirs.push(path);
        }
    }
    dirs.sort();
    Ok(dirs)
}

fn read_manifest(dir: &Path) -> Option<UnitManifest> {
    let path = dir.join(MANIFEST_FILE);
    let content = std::fs::read_to_string(&path).ok()?;
    match serde_json::from_str(&content) {
        Ok(manifest) => Some(manifest),
        Err(e) => {
            warn!("Skipping unit with malformed manifest {:?}: {}", path, e);
            None
        }
    }
}

fn end_piece(dir: &Path) -> String {
    dir.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// `name`, or `name-2`, `name-3`, ... if already taken.
fn unique_key(taken: &mut HashSet<String>, name: &str) -> String {
    let mut key = name.to_string();
    let mut i = 1;
    while taken.contains(&key) {
        i += 1;
        key = format!("{}-{}", name, i);
    }
    taken.insert(key.clone());
    key
}
