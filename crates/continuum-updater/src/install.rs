//! Kind-specific package installation.
//!
//! Each [`PackageKind`] has an [`Installable`] implementation that places a
//! verified artifact into its unit directory:
//!
//! ```text
//! <root>/core/<name>.zip
//! <root>/extensions/<name>/<name>.pkg
//! <root>/themes/<supplier>/<name>/<name>.zip
//! ```
//!
//! Placement copies the artifact to a staging file next to the target,
//! keeps the previous package as `<file>.old`, and renames the staging file
//! over the target. If any step after the backup fails the previous
//! package is restored. The unit's `manifest.json` gets the new version;
//! all other manifest fields are preserved.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::artifact::UpdateArtifact;
use crate::error::UpdateError;
use crate::package::{PackageIdentity, PackageKind};

/// Manifest file kept in every unit directory.
pub const MANIFEST_FILE: &str = "manifest.json";

/// Kind-specific install capability.
#[async_trait]
pub trait Installable: Send + Sync {
    /// The package kind this installer accepts.
    fn kind(&self) -> PackageKind;

    /// Place a fully verified artifact.
    ///
    /// `unit_dir` names an existing unit directory found on disk; when it is
    /// `None` the directory is derived from the artifact's identity.
    ///
    /// # Errors
    ///
    /// Returns `UpdateError::InstallationFailed` for an invalid or
    /// conflicting target, or if the files cannot be written.
    async fn install(
        &self,
        artifact: &UpdateArtifact,
        unit_dir: Option<&Path>,
    ) -> Result<(), UpdateError>;
}

/// Directory layout of installed units.
#[derive(Debug, Clone)]
pub struct InstallLayout {
    root: PathBuf,
}

impl InstallLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn core_dir(&self) -> PathBuf {
        self.root.join("core")
    }

    pub fn extensions_root(&self) -> PathBuf {
        self.root.join("extensions")
    }

    pub fn themes_root(&self) -> PathBuf {
        self.root.join("themes")
    }

    /// Directory holding every unit of `kind`.
    pub fn kind_root(&self, kind: PackageKind) -> PathBuf {
        match kind {
            PackageKind::Core => self.core_dir(),
            PackageKind::Extension => self.extensions_root(),
            PackageKind::Theme => self.themes_root(),
        }
    }

    /// Directory holding the unit identified by `identity`.
    pub fn unit_dir(&self, identity: &PackageIdentity) -> PathBuf {
        match identity.kind {
            PackageKind::Core => self.core_dir(),
            PackageKind::Extension => self.extensions_root().join(&identity.name),
            PackageKind::Theme => self.themes_root().join(&identity.supplier).join(&identity.name),
        }
    }
}

/// Installs the core platform package.
pub struct CoreInstaller {
    layout: InstallLayout,
}

impl CoreInstaller {
    pub fn new(layout: InstallLayout) -> Self {
        Self { layout }
    }
}

#[async_trait]
impl Installable for CoreInstaller {
    fn kind(&self) -> PackageKind {
        PackageKind::Core
    }

    async fn install(
        &self,
        artifact: &UpdateArtifact,
        unit_dir: Option<&Path>,
    ) -> Result<(), UpdateError> {
        place_package(&self.layout, self.kind(), artifact, unit_dir)
    }
}

/// Installs extensions.
pub struct ExtensionInstaller {
    layout: InstallLayout,
}

impl ExtensionInstaller {
    pub fn new(layout: InstallLayout) -> Self {
        Self { layout }
    }
}

#[async_trait]
impl Installable for ExtensionInstaller {
    fn kind(&self) -> PackageKind {
        PackageKind::Extension
    }

    async fn install(
        &self,
        artifact: &UpdateArtifact,
        unit_dir: Option<&Path>,
    ) -> Result<(), UpdateError> {
        place_package(&self.layout, self.kind(), artifact, unit_dir)
    }
}

/// Installs themes, one directory per supplier.
pub struct ThemeInstaller {
    layout: InstallLayout,
}

impl ThemeInstaller {
    pub fn new(layout: InstallLayout) -> Self {
        Self { layout }
    }
}

#[async_trait]
impl Installable for ThemeInstaller {
    fn kind(&self) -> PackageKind {
        PackageKind::Theme
    }

    async fn install(
        &self,
        artifact: &UpdateArtifact,
        unit_dir: Option<&Path>,
    ) -> Result<(), UpdateError> {
        place_package(&self.layout, self.kind(), artifact, unit_dir)
    }
}

/// Maps each package kind to its installer.
#[derive(Clone, Default)]
pub struct InstallerSet {
    installers: HashMap<PackageKind, Arc<dyn Installable>>,
}

impl InstallerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// The core, extension, and theme installers rooted at `root`.
    pub fn standard(root: impl Into<PathBuf>) -> Self {
        let layout = InstallLayout::new(root);
        Self::new()
            .with(Arc::new(CoreInstaller::new(layout.clone())))
            .with(Arc::new(ExtensionInstaller::new(layout.clone())))
            .with(Arc::new(ThemeInstaller::new(layout)))
    }

    /// Register `installer` for its kind, replacing any previous one.
    pub fn with(mut self, installer: Arc<dyn Installable>) -> Self {
        self.installers.insert(installer.kind(), installer);
        self
    }

    pub fn get(&self, kind: PackageKind) -> Option<Arc<dyn Installable>> {
        self.installers.get(&kind).cloned()
    }
}

/// Whether `name` is safe to use as a single path component.
pub fn is_valid_unit_name(name: &str) -> bool {
    !name.is_empty()
        && !name.contains("..")
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

fn place_package(
    layout: &InstallLayout,
    kind: PackageKind,
    artifact: &UpdateArtifact,
    unit_dir: Option<&Path>,
) -> Result<(), UpdateError> {
    let identity = artifact.identity();
    if identity.kind != kind {
        return Err(UpdateError::InstallationFailed(format!(
            "{} installer cannot install a {} package",
            kind, identity.kind
        )));
    }
    for name in [&identity.supplier, &identity.name] {
        if !is_valid_unit_name(name) {
            return Err(UpdateError::InstallationFailed(format!(
                "invalid package or supplier name: {:?}",
                name
            )));
        }
    }

    let unit_dir = match unit_dir {
        Some(dir) => {
            let kind_root = layout.kind_root(kind);
            let escapes = dir.components().any(|c| matches!(c, Component::ParentDir));
            if escapes || !dir.starts_with(&kind_root) {
                return Err(UpdateError::InstallationFailed(format!(
                    "unit directory {} is outside {}",
                    dir.display(),
                    kind_root.display()
                )));
            }
            dir.to_path_buf()
        }
        None => layout.unit_dir(identity),
    };
    std::fs::create_dir_all(&unit_dir).map_err(|e| {
        UpdateError::InstallationFailed(format!("cannot create {}: {}", unit_dir.display(), e))
    })?;

    let file_name = format!("{}.{}", identity.name, kind.file_extension());
    let target = unit_dir.join(&file_name);
    if let Ok(meta) = std::fs::symlink_metadata(&target) {
        if !meta.is_file() {
            return Err(UpdateError::InstallationFailed(format!(
                "conflicting install target: {}",
                target.display()
            )));
        }
    }

    info!(
        package = %identity,
        version = artifact.version(),
        "Installing package to {:?}",
        target
    );
    replace_package(artifact.path(), &target)?;

    let manifest = unit_dir.join(MANIFEST_FILE);
    if let Err(e) = write_manifest_version(&manifest, identity, artifact.version()) {
        warn!("Failed to update manifest, restoring previous package");
        restore_backup(&target);
        return Err(e);
    }

    debug!("Package installed successfully");
    Ok(())
}

fn backup_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_os_string();
    name.push(".old");
    PathBuf::from(name)
}

fn staging_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_os_string();
    name.push(".staging");
    PathBuf::from(name)
}

fn replace_package(source: &Path, target: &Path) -> Result<(), UpdateError> {
    let staging = staging_path(target);
    let old_path = backup_path(target);

    std::fs::copy(source, &staging).map_err(|e| {
        let _ = std::fs::remove_file(&staging);
        UpdateError::InstallationFailed(format!("failed to stage package: {}", e))
    })?;

    if old_path.exists() {
        std::fs::remove_file(&old_path).map_err(|e| {
            let _ = std::fs::remove_file(&staging);
            UpdateError::InstallationFailed(format!("failed to remove old backup: {}", e))
        })?;
    }

    if target.exists() {
        std::fs::rename(target, &old_path).map_err(|e| {
            let _ = std::fs::remove_file(&staging);
            UpdateError::InstallationFailed(format!("failed to back up current package: {}", e))
        })?;
    }

    if let Err(e) = std::fs::rename(&staging, target) {
        warn!("Failed to move new package into place, restoring previous package");
        let _ = std::fs::remove_file(&staging);
        restore_backup(target);
        return Err(UpdateError::InstallationFailed(format!(
            "failed to move package into place: {}",
            e
        )));
    }

    Ok(())
}

fn restore_backup(target: &Path) {
    let old_path = backup_path(target);
    if old_path.exists() {
        let _ = std::fs::rename(&old_path, target);
    } else {
        let _ = std::fs::remove_file(target);
    }
}

/// Set `version` in the unit manifest, creating the manifest if needed.
fn write_manifest_version(
    path: &Path,
    identity: &PackageIdentity,
    version: &str,
) -> Result<(), UpdateError> {
    let mut manifest = match std::fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str::<Value>(&content) {
            Ok(Value::Object(map)) => map,
            _ => {
                return Err(UpdateError::InstallationFailed(format!(
                    "malformed manifest: {}",
                    path.display()
                )))
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Map::new(),
        Err(e) => return Err(e.into()),
    };

    manifest.insert("version".to_string(), Value::String(version.to_string()));
    manifest
        .entry("supplier")
        .or_insert_with(|| Value::String(identity.supplier.clone()));
    manifest
        .entry("name")
        .or_insert_with(|| Value::String(identity.name.clone()));

    let staging = staging_path(path);
    std::fs::write(&staging, serde_json::to_vec_pretty(&Value::Object(manifest))?)?;
    std::fs::rename(&staging, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn artifact(dir: &Path, kind: PackageKind, name: &str, body: &[u8]) -> UpdateArtifact {
        UpdateArtifact::write_temporary(
            &dir.join("downloads"),
            PackageIdentity::new(kind, "acme", name),
            "2.0.0",
            body,
            None,
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_unit_name_validation() {
        assert!(is_valid_unit_name("widget-2.x_beta"));
        assert!(!is_valid_unit_name(""));
        assert!(!is_valid_unit_name(".."));
        assert!(!is_valid_unit_name("a..b"));
        assert!(!is_valid_unit_name("a/b"));
        assert!(!is_valid_unit_name("a b"));
    }

    #[test]
    fn test_layout() {
        let layout = InstallLayout::new("/srv");
        assert_eq!(
            layout.unit_dir(&PackageIdentity::new(PackageKind::Core, "acme", "core")),
            PathBuf::from("/srv/core")
        );
        assert_eq!(
            layout.unit_dir(&PackageIdentity::new(PackageKind::Extension, "acme", "w")),
            PathBuf::from("/srv/extensions/w")
        );
        assert_eq!(
            layout.unit_dir(&PackageIdentity::new(PackageKind::Theme, "acme", "t")),
            PathBuf::from("/srv/themes/acme/t")
        );
    }

    #[tokio::test]
    async fn test_extension_install_places_file_and_manifest() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("site");
        let installer = ExtensionInstaller::new(InstallLayout::new(&root));

        installer
            .install(&artifact(dir.path(), PackageKind::Extension, "widget", b"v2"), None)
            .await
            .unwrap();

        let unit = root.join("extensions/widget");
        assert_eq!(std::fs::read(unit.join("widget.pkg")).unwrap(), b"v2");
        let manifest: Value =
            serde_json::from_slice(&std::fs::read(unit.join(MANIFEST_FILE)).unwrap()).unwrap();
        assert_eq!(manifest["version"], "2.0.0");
        assert_eq!(manifest["supplier"], "acme");
    }

    #[tokio::test]
    async fn test_reinstall_keeps_backup_and_preserves_manifest_fields() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("site");
        let unit = root.join("themes/acme/dark");
        std::fs::create_dir_all(&unit).unwrap();
        std::fs::write(unit.join("dark.zip"), b"v1").unwrap();
        std::fs::write(
            unit.join(MANIFEST_FILE),
            r#"{"supplier":"acme","name":"dark","version":"1.0.0","title":"Dark"}"#,
        )
        .unwrap();

        let installer = ThemeInstaller::new(InstallLayout::new(&root));
        installer
            .install(&artifact(dir.path(), PackageKind::Theme, "dark", b"v2"), None)
            .await
            .unwrap();

        assert_eq!(std::fs::read(unit.join("dark.zip")).unwrap(), b"v2");
        assert_eq!(std::fs::read(unit.join("dark.zip.old")).unwrap(), b"v1");
        let manifest: Value =
            serde_json::from_slice(&std::fs::read(unit.join(MANIFEST_FILE)).unwrap()).unwrap();
        assert_eq!(manifest["version"], "2.0.0");
        assert_eq!(manifest["title"], "Dark");
    }

    #[tokio::test]
    async fn test_conflicting_target_rejected() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("site");
        std::fs::create_dir_all(root.join("extensions/widget/widget.pkg")).unwrap();

        let installer = ExtensionInstaller::new(InstallLayout::new(&root));
        let result = installer
            .install(&artifact(dir.path(), PackageKind::Extension, "widget", b"v2"), None)
            .await;
        assert!(matches!(result, Err(UpdateError::InstallationFailed(_))));
    }

    #[tokio::test]
    async fn test_malformed_manifest_restores_previous_package() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("site");
        let unit = root.join("extensions/widget");
        std::fs::create_dir_all(&unit).unwrap();
        std::fs::write(unit.join("widget.pkg"), b"v1").unwrap();
        std::fs::write(unit.join(MANIFEST_FILE), "[1, 2, 3]").unwrap();

        let installer = ExtensionInstaller::new(InstallLayout::new(&root));
        let result = installer
            .install(&artifact(dir.path(), PackageKind::Extension, "widget", b"v2"), None)
            .await;

        assert!(matches!(result, Err(UpdateError::InstallationFailed(_))));
        assert_eq!(std::fs::read(unit.join("widget.pkg")).unwrap(), b"v1");
    }

    #[tokio::test]
    async fn test_install_into_discovered_unit_dir() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("site");
        let unit = root.join("extensions/widget-copy");
        std::fs::create_dir_all(&unit).unwrap();
        std::fs::write(
            unit.join(MANIFEST_FILE),
            r#"{"supplier":"acme","name":"widget","version":"1.0.0"}"#,
        )
        .unwrap();

        let installer = ExtensionInstaller::new(InstallLayout::new(&root));
        installer
            .install(
                &artifact(dir.path(), PackageKind::Extension, "widget", b"v2"),
                Some(&unit),
            )
            .await
            .unwrap();

        assert_eq!(std::fs::read(unit.join("widget.pkg")).unwrap(), b"v2");
        let manifest: Value =
            serde_json::from_slice(&std::fs::read(unit.join(MANIFEST_FILE)).unwrap()).unwrap();
        assert_eq!(manifest["version"], "2.0.0");
        assert!(!root.join("extensions/widget").exists());
    }

    #[tokio::test]
    async fn test_unit_dir_outside_kind_root_rejected() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("site");
        let installer = ExtensionInstaller::new(InstallLayout::new(&root));

        for target in [
            root.join("themes/acme/widget"),
            root.join("extensions/../core"),
            dir.path().join("elsewhere"),
        ] {
            let result = installer
                .install(
                    &artifact(dir.path(), PackageKind::Extension, "widget", b"v2"),
                    Some(&target),
                )
                .await;
            assert!(matches!(result, Err(UpdateError::InstallationFailed(_))));
            assert!(!target.join("widget.pkg").exists());
        }
    }

    #[tokio::test]
    async fn test_kind_mismatch_rejected() {
        let dir = TempDir::new().unwrap();
        let installer = CoreInstaller::new(InstallLayout::new(dir.path().join("site")));
        let result = installer
            .install(&artifact(dir.path(), PackageKind::Theme, "dark", b"x"), None)
            .await;
        assert!(matches!(result, Err(UpdateError::InstallationFailed(_))));
    }

    #[test]
    fn test_installer_set_standard() {
        let set = InstallerSet::standard("/srv");
        for kind in PackageKind::ALL {
            assert_eq!(set.get(kind).unwrap().kind(), kind);
        }
        assert!(InstallerSet::new().get(PackageKind::Core).is_none());
    }
}
