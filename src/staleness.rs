//! Staleness Checker (spec §4.F): does an externally-booted snapshot's
//! `lib/modules/` content still match the kernel modules the boot
//! partition's kernel would load? Grounded on the teacher's
//! `packagesystem` read-a-text-file-then-compare shape (there applied
//! to RPM package metadata, here to `pkgbase` sidecar files).

use std::path::Path;

use anyhow::{Context, Result};

use crate::bootimage::BootSet;
use crate::config::StaleAction;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DetectionMethod {
    BinaryHeader,
    Pkgbase,
    AssumedFresh,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StaleReason {
    NoModulesDir,
    ModulesMissing,
}

#[derive(Clone, Debug)]
pub struct StalenessResult {
    pub is_stale: bool,
    pub method: DetectionMethod,
    pub reason: Option<StaleReason>,
    pub expected_version: Option<String>,
    pub snapshot_modules: Vec<String>,
    pub warning: Option<String>,
}

impl StalenessResult {
    pub fn is_stale(&self) -> bool {
        self.is_stale
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResolvedAction {
    pub action: StaleAction,
    pub fallback_used: bool,
}

fn list_module_dirs(snapshot_path: &Path) -> Result<Vec<String>> {
    let modules_dir = snapshot_path.join("lib/modules");
    if !modules_dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut names: Vec<String> = std::fs::read_dir(&modules_dir)
        .with_context(|| format!("reading {}", modules_dir.display()))?
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|name| !name.starts_with("extramodules-"))
        .collect();
    names.sort();
    Ok(names)
}

/// Check whether `boot_set`'s external kernel is still served by the
/// modules present in `snapshot_path`.
pub fn check(snapshot_path: &Path, boot_set: &BootSet) -> Result<StalenessResult> {
    let module_dirs = list_module_dirs(snapshot_path)?;
    if module_dirs.is_empty() {
        return Ok(StalenessResult {
            is_stale: true,
            method: DetectionMethod::BinaryHeader,
            reason: Some(StaleReason::NoModulesDir),
            expected_version: None,
            snapshot_modules: Vec::new(),
            warning: None,
        });
    }

    if let Some(inspected) = boot_set.kernel.as_ref().and_then(|k| k.inspected.as_ref()) {
        if let Some(short) = &inspected.short_version {
            if module_dirs.iter().any(|d| d == short) {
                return Ok(StalenessResult {
                    is_stale: false,
                    method: DetectionMethod::BinaryHeader,
                    reason: None,
                    expected_version: Some(short.clone()),
                    snapshot_modules: module_dirs,
                    warning: None,
                });
            }
            return Ok(StalenessResult {
                is_stale: true,
                method: DetectionMethod::BinaryHeader,
                reason: Some(StaleReason::ModulesMissing),
                expected_version: Some(short.clone()),
                snapshot_modules: module_dirs,
                warning: None,
            });
        }
    }

    for dir in &module_dirs {
        let pkgbase_path = snapshot_path.join("lib/modules").join(dir).join("pkgbase");
        if let Ok(contents) = std::fs::read_to_string(&pkgbase_path) {
            if contents.trim() == boot_set.kernel_name {
                return Ok(StalenessResult {
                    is_stale: false,
                    method: DetectionMethod::Pkgbase,
                    reason: None,
                    expected_version: Some(boot_set.kernel_name.clone()),
                    snapshot_modules: module_dirs,
                    warning: None,
                });
            }
        }
    }

    Ok(StalenessResult {
        is_stale: false,
        method: DetectionMethod::AssumedFresh,
        reason: None,
        expected_version: None,
        snapshot_modules: module_dirs,
        warning: Some("could not verify module version; assuming snapshot is bootable".to_string()),
    })
}

/// Resolve a configured action against a staleness result (spec
/// invariant #5: `Fallback` downgrades to `Disable` when there is no
/// fallback initramfs to fall back to).
pub fn resolve_action(result: &StalenessResult, configured: StaleAction, boot_set: &BootSet) -> ResolvedAction {
    if !result.is_stale {
        return ResolvedAction {
            action: configured,
            fallback_used: false,
        };
    }
    match configured {
        StaleAction::Fallback => {
            if boot_set.fallback_initramfs.is_some() {
                ResolvedAction {
                    action: StaleAction::Fallback,
                    fallback_used: true,
                }
            } else {
                log::warn!(
                    "kernel {:?} is stale and has no fallback initramfs, disabling its boot entry",
                    boot_set.kernel_name
                );
                ResolvedAction {
                    action: StaleAction::Disable,
                    fallback_used: false,
                }
            }
        }
        other => ResolvedAction {
            action: other,
            fallback_used: false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootimage::{BootImage, ImageRole, InspectedKernel};

    fn boot_set_with_inspected(kernel_name: &str, short_version: Option<&str>) -> BootSet {
        BootSet {
            kernel_name: kernel_name.to_string(),
            kernel: Some(BootImage {
                esp_relative_path: format!("vmlinuz-{kernel_name}"),
                role: ImageRole::Kernel,
                kernel_name: kernel_name.to_string(),
                inspected: short_version.map(|v| InspectedKernel {
                    boot_protocol_version: "2.12".to_string(),
                    full_version: Some(v.to_string()),
                    short_version: Some(v.to_string()),
                }),
                compression: None,
            }),
            initramfs: None,
            fallback_initramfs: None,
            microcode: Vec::new(),
        }
    }

    #[test]
    fn no_modules_dir_is_stale() {
        let td = tempfile::tempdir().unwrap();
        let set = boot_set_with_inspected("linux", None);
        let result = check(td.path(), &set).unwrap();
        assert!(result.is_stale());
        assert_eq!(result.reason, Some(StaleReason::NoModulesDir));
    }

    #[test]
    fn binary_header_match_is_fresh() {
        let td = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(td.path().join("lib/modules/6.19.0-2-cachyos")).unwrap();
        let set = boot_set_with_inspected("linux", Some("6.19.0-2-cachyos"));
        let result = check(td.path(), &set).unwrap();
        assert!(!result.is_stale());
        assert_eq!(result.method, DetectionMethod::BinaryHeader);
        assert_eq!(result.snapshot_modules, vec!["6.19.0-2-cachyos".to_string()]);
    }

    #[test]
    fn extramodules_dirs_are_excluded() {
        let td = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(td.path().join("lib/modules/extramodules-6.19-cachyos")).unwrap();
        let set = boot_set_with_inspected("linux", None);
        let result = check(td.path(), &set).unwrap();
        assert!(result.is_stale());
        assert_eq!(result.reason, Some(StaleReason::NoModulesDir));
    }

    #[test]
    fn pkgbase_fallback_match_is_fresh() {
        let td = tempfile::tempdir().unwrap();
        let moddir = td.path().join("lib/modules/6.19.0");
        std::fs::create_dir_all(&moddir).unwrap();
        std::fs::write(moddir.join("pkgbase"), "linux-lts\n").unwrap();
        let set = boot_set_with_inspected("linux-lts", None);
        let result = check(td.path(), &set).unwrap();
        assert!(!result.is_stale());
        assert_eq!(result.method, DetectionMethod::Pkgbase);
    }

    #[test]
    fn no_match_is_assumed_fresh_with_warning() {
        let td = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(td.path().join("lib/modules/6.0.0")).unwrap();
        let set = boot_set_with_inspected("linux", None);
        let result = check(td.path(), &set).unwrap();
        assert!(!result.is_stale());
        assert_eq!(result.method, DetectionMethod::AssumedFresh);
        assert!(result.warning.is_some());
    }

    #[test]
    fn fallback_downgrades_to_disable_without_fallback_image() {
        let stale = StalenessResult {
            is_stale: true,
            method: DetectionMethod::BinaryHeader,
            reason: Some(StaleReason::ModulesMissing),
            expected_version: Some("6.19.0".to_string()),
            snapshot_modules: vec![],
            warning: None,
        };
        let set = boot_set_with_inspected("linux", Some("6.19.0"));
        let resolved = resolve_action(&stale, StaleAction::Fallback, &set);
        assert_eq!(resolved.action, StaleAction::Disable);
        assert!(!resolved.fallback_used);
    }

    #[test]
    fn fallback_is_used_when_image_present() {
        let stale = StalenessResult {
            is_stale: true,
            method: DetectionMethod::BinaryHeader,
            reason: Some(StaleReason::ModulesMissing),
            expected_version: Some("6.19.0".to_string()),
            snapshot_modules: vec![],
            warning: None,
        };
        let mut set = boot_set_with_inspected("linux", Some("6.19.0"));
        set.fallback_initramfs = Some(BootImage {
            esp_relative_path: "initramfs-linux-fallback.img".to_string(),
            role: ImageRole::FallbackInitramfs,
            kernel_name: "linux".to_string(),
            inspected: None,
            compression: None,
        });
        let resolved = resolve_action(&stale, StaleAction::Fallback, &set);
        assert_eq!(resolved.action, StaleAction::Fallback);
        assert!(resolved.fallback_used);
    }

    #[test]
    fn non_fallback_actions_pass_through() {
        let stale = StalenessResult {
            is_stale: true,
            method: DetectionMethod::BinaryHeader,
            reason: Some(StaleReason::ModulesMissing),
            expected_version: None,
            snapshot_modules: vec![],
            warning: None,
        };
        let set = boot_set_with_inspected("linux", None);
        assert_eq!(resolve_action(&stale, StaleAction::Delete, &set).action, StaleAction::Delete);
        assert_eq!(resolve_action(&stale, StaleAction::Warn, &set).action, StaleAction::Warn);
    }
}
