//! Boot Planner (spec §4.G): decides, per snapshot, whether its kernel
//! lives inside the snapshot itself or on the external boot partition,
//! and builds one `BootPlan` per resulting boot entry.
//!
//! Grounded on the design note "use tagged variants... 'exactly one
//! group populated' is then type-enforced": `BootPlan` is an enum, not
//! a struct with optional fields, mirroring the teacher's preference
//! for `enum Component` dispatch over boolean-flag structs.

use std::path::Path;

use crate::bootimage::{self, BootSet, PatternConfig};
use crate::config::StaleAction;
use crate::device::Identifiers;
use crate::fstab::{self, Fstab};
use crate::staleness::{self, ResolvedAction, StalenessResult};

#[derive(Clone, Debug)]
pub enum BootPlan {
    InSnapshot {
        snapshot_id: u64,
        kernel_path: String,
        initrd_paths: Vec<String>,
        root_identifier: String,
    },
    External {
        snapshot_id: u64,
        kernel_name: String,
        staleness: Option<StalenessResult>,
        resolved_action: Option<ResolvedAction>,
    },
}

impl BootPlan {
    pub fn snapshot_id(&self) -> u64 {
        match self {
            BootPlan::InSnapshot { snapshot_id, .. } => *snapshot_id,
            BootPlan::External { snapshot_id, .. } => *snapshot_id,
        }
    }

    /// InSnapshot plans are never stale (spec invariant #4).
    pub fn is_stale(&self) -> bool {
        match self {
            BootPlan::InSnapshot { .. } => false,
            BootPlan::External { staleness, .. } => staleness.as_ref().map(|s| s.is_stale()).unwrap_or(false),
        }
    }

    /// An External plan whose resolved action is `Delete` is skippable.
    pub fn should_skip(&self) -> bool {
        match self {
            BootPlan::InSnapshot { .. } => false,
            BootPlan::External { resolved_action, .. } => {
                resolved_action.as_ref().map(|r| r.action == StaleAction::Delete).unwrap_or(false)
            }
        }
    }
}

/// Label > part_label > UUID > part_uuid, the order the root-fs
/// identifier is preferred in for an in-snapshot `root=` parameter.
/// Deliberately distinct from `Identifiers::best_identifier`'s UUID-
/// first order, which is used for device matching, not display.
fn root_identifier_for_plan(identifiers: &Identifiers) -> String {
    if !identifiers.label.is_empty() {
        format!("LABEL={}", identifiers.label)
    } else if !identifiers.part_label.is_empty() {
        format!("PARTLABEL={}", identifiers.part_label)
    } else if !identifiers.uuid.is_empty() {
        format!("UUID={}", identifiers.uuid)
    } else if !identifiers.part_uuid.is_empty() {
        format!("PARTUUID={}", identifiers.part_uuid)
    } else {
        identifiers.device.clone()
    }
}

fn external_plans(snapshot_id: u64, snapshot_path: &Path, boot_sets: &[BootSet], stale_action: StaleAction) -> Vec<BootPlan> {
    if boot_sets.is_empty() {
        return vec![BootPlan::External {
            snapshot_id,
            kernel_name: String::new(),
            staleness: None,
            resolved_action: None,
        }];
    }
    boot_sets
        .iter()
        .map(|boot_set| {
            let staleness = match staleness::check(snapshot_path, boot_set) {
                Ok(result) => Some(result),
                Err(e) => {
                    log::warn!(
                        "staleness check failed for snapshot {snapshot_id} kernel {:?}: {e:#}",
                        boot_set.kernel_name
                    );
                    None
                }
            };
            let resolved_action = staleness.as_ref().map(|s| staleness::resolve_action(s, stale_action, boot_set));
            BootPlan::External {
                snapshot_id,
                kernel_name: boot_set.kernel_name.clone(),
                staleness,
                resolved_action,
            }
        })
        .collect()
}

fn in_snapshot_plans(snapshot_id: u64, snapshot_path: &Path, snapshot_logical_path: &str, root_identifiers: &Identifiers) -> Vec<BootPlan> {
    let boot_dir = snapshot_path.join("boot");
    let images = match bootimage::scan(snapshot_path, &boot_dir, &PatternConfig::defaults()) {
        Ok(images) => images,
        Err(e) => {
            log::warn!("failed scanning in-snapshot boot images for snapshot {snapshot_id}: {e:#}");
            return Vec::new();
        }
    };
    let sets = bootimage::build_boot_sets(images);
    let logical_boot = format!("{}/boot", snapshot_logical_path.trim_end_matches('/'));
    let root_identifier = root_identifier_for_plan(root_identifiers);

    sets.into_iter()
        .filter_map(|set| {
            let kernel = set.kernel.as_ref()?;
            let mut initrd_paths: Vec<String> = set.microcode.iter().map(|m| format!("{logical_boot}/{}", file_name_of(&m.esp_relative_path))).collect();
            if let Some(initramfs) = &set.initramfs {
                initrd_paths.push(format!("{logical_boot}/{}", file_name_of(&initramfs.esp_relative_path)));
            }
            Some(BootPlan::InSnapshot {
                snapshot_id,
                kernel_path: format!("{logical_boot}/{}", file_name_of(&kernel.esp_relative_path)),
                initrd_paths,
                root_identifier: root_identifier.clone(),
            })
        })
        .collect()
}

fn file_name_of(esp_relative_path: &str) -> &str {
    esp_relative_path.rsplit('/').next().unwrap_or(esp_relative_path)
}

/// Plan boot entries for one snapshot.
///
/// `fstab_text` is `None` when the snapshot's fstab is missing or
/// unreadable; `Some(Err(_))` semantics are folded in by the caller
/// passing `None` on parse failure too, since both degrade identically
/// to the external-default branch.
#[allow(clippy::too_many_arguments)]
pub fn plan_snapshot(
    snapshot_id: u64,
    snapshot_path: &Path,
    snapshot_logical_path: &str,
    fstab_text: Option<&str>,
    cow_fstype: &str,
    root_identifiers: Option<&Identifiers>,
    boot_sets: &[BootSet],
    stale_action: StaleAction,
) -> Vec<BootPlan> {
    let fstab = match fstab_text {
        Some(text) => match Fstab::parse(text) {
            Ok(fstab) => Some(fstab),
            Err(e) => {
                log::warn!("snapshot {snapshot_id}: fstab parse error, falling back to external-default: {e:#}");
                None
            }
        },
        None => None,
    };

    let Some(fstab) = fstab else {
        return external_plans(snapshot_id, snapshot_path, boot_sets, stale_action);
    };

    let mount_info = fstab::Fstab::analyze_boot_mount(&fstab, cow_fstype, root_identifiers);
    if mount_info.boot_on_same_cow_fs {
        let Some(root_identifiers) = root_identifiers else {
            return external_plans(snapshot_id, snapshot_path, boot_sets, stale_action);
        };
        let plans = in_snapshot_plans(snapshot_id, snapshot_path, snapshot_logical_path, root_identifiers);
        if plans.is_empty() {
            external_plans(snapshot_id, snapshot_path, boot_sets, stale_action)
        } else {
            plans
        }
    } else {
        external_plans(snapshot_id, snapshot_path, boot_sets, stale_action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootimage::{BootImage, ImageRole, InspectedKernel};

    fn ids() -> Identifiers {
        Identifiers {
            device: "/dev/sda2".into(),
            uuid: "1111-2222".into(),
            part_uuid: String::new(),
            label: "root".into(),
            part_label: String::new(),
        }
    }

    #[test]
    fn root_identifier_prefers_label_over_uuid() {
        assert_eq!(root_identifier_for_plan(&ids()), "LABEL=root");
    }

    #[test]
    fn missing_fstab_produces_external_plans() {
        let td = tempfile::tempdir().unwrap();
        let boot_set = BootSet {
            kernel_name: "linux".to_string(),
            kernel: Some(BootImage {
                esp_relative_path: "vmlinuz-linux".into(),
                role: ImageRole::Kernel,
                kernel_name: "linux".into(),
                inspected: Some(InspectedKernel {
                    boot_protocol_version: "2.12".into(),
                    full_version: Some("6.0.0".into()),
                    short_version: Some("6.0.0".into()),
                }),
                compression: None,
            }),
            initramfs: None,
            fallback_initramfs: None,
            microcode: Vec::new(),
        };
        let plans = plan_snapshot(1, td.path(), "@/.snapshots/1/snapshot", None, "ext4", Some(&ids()), &[boot_set], StaleAction::Warn);
        assert_eq!(plans.len(), 1);
        assert!(matches!(plans[0], BootPlan::External { .. }));
        assert!(!plans[0].is_stale());
    }

    #[test]
    fn in_snapshot_candidate_with_kernel_becomes_in_snapshot_plan() {
        let td = tempfile::tempdir().unwrap();
        let boot_dir = td.path().join("boot");
        std::fs::create_dir_all(&boot_dir).unwrap();
        let mut bytes = vec![0u8; 0x210];
        bytes[0x202..0x206].copy_from_slice(b"HdrS");
        std::fs::write(boot_dir.join("vmlinuz-linux"), &bytes).unwrap();
        std::fs::write(boot_dir.join("initramfs-linux.img"), [0x1F, 0x8B]).unwrap();

        let fstab_text = "UUID=1111-2222 / btrfs rw,subvol=@ 0 0\n";
        let plans = plan_snapshot(2, td.path(), "@/.snapshots/2/snapshot", Some(fstab_text), "btrfs", Some(&ids()), &[], StaleAction::Warn);
        assert_eq!(plans.len(), 1);
        match &plans[0] {
            BootPlan::InSnapshot { kernel_path, initrd_paths, .. } => {
                assert_eq!(kernel_path, "@/.snapshots/2/snapshot/boot/vmlinuz-linux");
                assert_eq!(initrd_paths, &vec!["@/.snapshots/2/snapshot/boot/initramfs-linux.img".to_string()]);
            }
            _ => panic!("expected InSnapshot plan"),
        }
        assert!(!plans[0].is_stale());
        assert!(!plans[0].should_skip());
    }

    #[test]
    fn separate_non_cow_boot_is_external() {
        let td = tempfile::tempdir().unwrap();
        let fstab_text = "UUID=1111-2222 / btrfs rw,subvol=@ 0 0\nUUID=3333 /boot ext4 rw 0 2\n";
        let plans = plan_snapshot(3, td.path(), "@/.snapshots/3/snapshot", Some(fstab_text), "btrfs", Some(&ids()), &[], StaleAction::Warn);
        assert!(matches!(plans[0], BootPlan::External { .. }));
    }

    #[test]
    fn delete_action_marks_plan_skippable() {
        let td = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(td.path().join("lib/modules/6.0.0")).unwrap();
        let boot_set = BootSet {
            kernel_name: "linux".to_string(),
            kernel: Some(BootImage {
                esp_relative_path: "vmlinuz-linux".into(),
                role: ImageRole::Kernel,
                kernel_name: "linux".into(),
                inspected: Some(InspectedKernel {
                    boot_protocol_version: "2.12".into(),
                    full_version: Some("9.9.9".into()),
                    short_version: Some("9.9.9".into()),
                }),
                compression: None,
            }),
            initramfs: None,
            fallback_initramfs: None,
            microcode: Vec::new(),
        };
        let plans = plan_snapshot(4, td.path(), "@/.snapshots/4/snapshot", None, "ext4", Some(&ids()), &[boot_set], StaleAction::Delete);
        assert!(plans[0].is_stale());
        assert!(plans[0].should_skip());
    }
}
