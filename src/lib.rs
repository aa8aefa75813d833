//! Generates firmware boot-manager menu entries for read-only and
//! writable snapshots of a copy-on-write root filesystem: discovers
//! snapshots, plans which kernel each one should boot, and rewrites
//! the bootloader's managed config files (main config + per-kernel
//! sidecars + each snapshot's own fstab) to match.

#![deny(unused_must_use)]
#![allow(clippy::style)]

pub mod bootconfig;
pub mod bootimage;
pub mod cli;
pub mod config;
pub mod device;
pub mod error;
pub mod esp;
pub mod filesystem;
pub mod fstab;
pub mod generator;
pub mod listing;
pub mod params;
pub mod patch;
pub mod planner;
pub mod runner;
pub mod snapshot;
pub mod staleness;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::bootimage::BootSet;
use crate::config::{Config, StaleAction, WritableMethod};
use crate::device::{DeviceSpec, Identifiers};
use crate::error::FatalError;
use crate::esp::{EspDetector, StatfsEspDetector};
use crate::filesystem::Filesystem;
use crate::fstab::Fstab;
use crate::patch::{self, FileDiff, PatchDiff};
use crate::planner::{self, BootPlan};
use crate::runner::Runner;
use crate::snapshot::Snapshot;

const DEFAULT_COW_FSTYPE: &str = "btrfs";
const RWSNAP_RETENTION: usize = 5;

pub fn run<T>(args: impl IntoIterator<Item = T>) -> Result<()>
where
    T: Into<std::ffi::OsString> + Clone,
{
    use clap::Parser;
    let opts = cli::Cli::parse_from(args);
    opts.run()
}

/// Read the live system's root fstab entry for `cow_fstype` and build
/// an `Identifiers` bag carrying whichever single tag it was mounted by.
fn detect_root_identifiers(fstab_path: &Path, cow_fstype: &str) -> Result<Identifiers> {
    let fstab = Fstab::read(fstab_path).with_context(|| format!("reading {}", fstab_path.display()))?;
    let entry = fstab
        .entries
        .iter()
        .find(|e| e.mount_point == "/" && e.fstype == cow_fstype)
        .ok_or_else(|| FatalError::RootNotCowFs(cow_fstype.to_string()))?;

    let spec = DeviceSpec::parse(&entry.device);
    let mut identifiers = Identifiers::default();
    match spec.tag {
        device::DeviceTag::Uuid => identifiers.uuid = spec.value,
        device::DeviceTag::PartUuid => identifiers.part_uuid = spec.value,
        device::DeviceTag::Label => identifiers.label = spec.value,
        device::DeviceTag::PartLabel => identifiers.part_label = spec.value,
        device::DeviceTag::Device => identifiers.device = spec.value,
    }
    Ok(identifiers)
}

fn select_snapshots<'a>(snapshots: &'a [Snapshot], selection_count: usize) -> Vec<&'a Snapshot> {
    if selection_count == 0 {
        snapshots.iter().collect()
    } else {
        snapshots.iter().take(selection_count).collect()
    }
}

/// Resolve the mount point of the firmware boot partition per
/// `cfg.boot_partition`: auto-detect through `esp_detector` (cross-
/// checking the configured UUID, if any) or fall back to the
/// configured/conventional mount point and merely validate it.
fn resolve_esp_mount(cfg: &Config, esp_detector: &dyn EspDetector) -> PathBuf {
    if cfg.boot_partition.auto_detect {
        match esp_detector.find() {
            Ok((_, mount_point, identifiers)) => {
                if let Some(expected_uuid) = &cfg.boot_partition.uuid {
                    if !identifiers.uuid.is_empty() && &identifiers.uuid != expected_uuid {
                        log::warn!(
                            "auto-detected boot partition UUID {:?} does not match configured boot_partition.uuid {expected_uuid:?}",
                            identifiers.uuid
                        );
                    }
                }
                mount_point
            }
            Err(e) => {
                let fallback = cfg.boot_partition.mount_point.clone().unwrap_or_else(|| PathBuf::from("/boot/efi"));
                log::warn!("boot-partition auto-detection failed, falling back to {}: {e:#}", fallback.display());
                fallback
            }
        }
    } else {
        let mount_point = cfg.boot_partition.mount_point.clone().unwrap_or_else(|| PathBuf::from("/boot/efi"));
        if let Err(e) = esp_detector.validate_path(&mount_point) {
            log::warn!("configured boot partition {} failed validation: {e:#}", mount_point.display());
        }
        mount_point
    }
}

/// Plan boot entries for one snapshot against the already-scanned
/// external boot sets (spec §4.G), reading that snapshot's own fstab
/// to classify it as in-snapshot or external.
fn snapshot_boot_plans(snapshot: &Snapshot, root_identifiers: &Identifiers, boot_sets: &[BootSet], stale_action: StaleAction) -> Vec<BootPlan> {
    let fstab_path = snapshot.filesystem_path.join("etc/fstab");
    let fstab_text = std::fs::read_to_string(&fstab_path).ok();
    planner::plan_snapshot(
        snapshot.id(),
        &snapshot.filesystem_path,
        snapshot.logical_path(),
        fstab_text.as_deref(),
        DEFAULT_COW_FSTYPE,
        Some(root_identifiers),
        boot_sets,
        stale_action,
    )
}

/// The `generate` subcommand: discover snapshots, plan each one's boot
/// entries and drop those that are entirely stale-and-deleted, make
/// the remaining selection writable per the configured method, then
/// rewrite the bootloader's main config, per-kernel sidecars, and each
/// selected snapshot's own fstab, showing a diff and (unless declined)
/// applying it.
pub fn generate(cfg: &Config, runner: &dyn Runner, auto_approve: bool, force: bool) -> Result<()> {
    let root_subvolume = filesystem::show(Path::new("/")).map_err(|_| FatalError::RootNotCowFs(DEFAULT_COW_FSTYPE.to_string()))?;

    if !force && cfg.behavior.exit_on_snapshot_boot && root_subvolume.is_snapshot && root_subvolume.path.contains(".snapshots") {
        anyhow::bail!(FatalError::BootedFromSnapshot);
    }

    let root_identifiers = detect_root_identifiers(Path::new("/etc/fstab"), DEFAULT_COW_FSTYPE)?;
    let filesystem = Filesystem {
        mount_point: PathBuf::from("/"),
        device: PathBuf::new(),
        identifiers: root_identifiers.clone(),
        root_subvolume,
    };

    let snapshots = snapshot::discover(&filesystem, &cfg.snapshot.search_directories, cfg.snapshot.max_depth)?;
    if snapshots.is_empty() {
        anyhow::bail!(FatalError::NoMatchingSourceEntries);
    }

    let esp_detector = StatfsEspDetector;
    let esp_mount = resolve_esp_mount(cfg, &esp_detector);

    let boot_sets = match bootimage::scan(&esp_mount, &esp_mount, &cfg.kernel.boot_image_patterns) {
        Ok(images) => bootimage::build_boot_sets(images),
        Err(e) => {
            log::warn!("failed scanning {} for boot images, treating every kernel as non-stale: {e:#}", esp_mount.display());
            Vec::new()
        }
    };
    let stale_action = cfg.kernel.stale_action();

    let mut selected = select_snapshots(&snapshots, cfg.snapshot.selection_count);
    selected.retain(|snapshot| {
        let plans = snapshot_boot_plans(snapshot, &root_identifiers, &boot_sets, stale_action);
        let fully_skippable = !plans.is_empty() && plans.iter().all(|p| p.should_skip());
        if fully_skippable {
            log::info!("snapshot {} is stale on every boot set and configured to delete, excluding it from generation", snapshot.id());
        }
        !fully_skippable
    });
    if selected.is_empty() {
        log::info!("no changes to apply");
        return Ok(());
    }

    match cfg.snapshot.writable_method {
        WritableMethod::Toggle => snapshot::toggle_writability(runner, &snapshots, &selected, cfg.behavior.cleanup_old_snapshots)?,
        WritableMethod::Copy => {
            for s in &selected {
                snapshot::copy_writable(
                    runner,
                    s,
                    &cfg.snapshot.destination_dir,
                    &cfg.advanced.naming_timestamp_format,
                    RWSNAP_RETENTION,
                    cfg.display.local_time,
                    cfg.behavior.cleanup_old_snapshots,
                )?;
            }
        }
    }

    let selected_owned: Vec<Snapshot> = selected.iter().map(|s| (*s).clone()).collect();

    // Held for the remainder of this function: guards against two
    // concurrent `rbgen generate` runs reading and rewriting the same
    // managed config files out from under each other. Skipped in
    // dry-run mode, which must not touch disk at all.
    let _write_lock = if runner.is_dry_run() {
        None
    } else {
        Some(patch::acquire_write_lock(&esp_mount).context("acquiring boot-config write lock")?)
    };

    let mut patch = PatchDiff::new();

    let config_path = cfg
        .boot_manager
        .config_path
        .clone()
        .or_else(|| bootconfig::find_config_path(&esp_mount, "refind"))
        .unwrap_or_else(|| esp_mount.join("EFI/BOOT/main.conf"));
    let original_main_config = patch::read_original(&config_path);
    for diff in generator::rewrite_main_config(&config_path, original_main_config.as_deref(), "Snapshot boot entries", &selected_owned) {
        patch.push(diff)?;
    }

    for snapshot in &selected {
        rewrite_snapshot_fstab(&mut patch, snapshot, &root_identifiers)?;
    }

    if patch.is_empty() {
        log::info!("no changes to apply");
        return Ok(());
    }
    if !patch.confirm(auto_approve)? {
        log::info!("changes declined");
        return Ok(());
    }
    if runner.is_dry_run() {
        log::info!("dry run: not writing any files");
        return Ok(());
    }
    patch.apply(runner)
}

fn rewrite_snapshot_fstab(patch: &mut PatchDiff, snapshot: &Snapshot, root_identifiers: &Identifiers) -> Result<()> {
    let fstab_path = snapshot.filesystem_path.join("etc/fstab");
    let Ok(text) = std::fs::read_to_string(&fstab_path) else {
        log::warn!("snapshot {}: no readable fstab at {}, skipping its fstab rewrite", snapshot.id(), fstab_path.display());
        return Ok(());
    };
    let fstab = match Fstab::parse(&text) {
        Ok(f) => f,
        Err(e) => {
            log::warn!("snapshot {}: fstab parse error, skipping its fstab rewrite: {e:#}", snapshot.id());
            return Ok(());
        }
    };
    let roots = fstab.root_entries(DEFAULT_COW_FSTYPE, root_identifiers);
    if roots.is_empty() {
        return Ok(());
    }
    let modified: Vec<(&fstab::FstabEntry, String)> = roots
        .iter()
        .map(|e| (*e, Fstab::options_for_snapshot(e, snapshot.logical_path(), snapshot.id())))
        .collect();
    let rewritten = fstab.rewrite(&modified);
    patch.push(FileDiff {
        path: fstab_path,
        original: Some(text),
        modified: rewritten,
    })?;
    Ok(())
}

/// The `list` subcommand: discover snapshots and report their on-disk
/// size using the bounded-parallelism walker.
pub fn list(cfg: &Config) -> Result<()> {
    let root_subvolume = filesystem::show(Path::new("/")).map_err(|_| FatalError::RootNotCowFs(DEFAULT_COW_FSTYPE.to_string()))?;
    let root_identifiers = detect_root_identifiers(Path::new("/etc/fstab"), DEFAULT_COW_FSTYPE).unwrap_or_default();
    let filesystem = Filesystem {
        mount_point: PathBuf::from("/"),
        device: PathBuf::new(),
        identifiers: root_identifiers,
        root_subvolume,
    };

    let snapshots = snapshot::discover(&filesystem, &cfg.snapshot.search_directories, cfg.snapshot.max_depth)?;
    let paths: Vec<PathBuf> = snapshots.iter().map(|s| s.filesystem_path.clone()).collect();

    let runtime = tokio::runtime::Builder::new_current_thread().enable_time().build().context("building listing runtime")?;
    let sizes = runtime.block_on(listing::compute_sizes(paths));

    for (snapshot, result) in snapshots.iter().zip(sizes.iter()) {
        let size_text = match &result.size {
            listing::ComputedSize::Bytes(n) => format!("{n}"),
            listing::ComputedSize::Timeout => "timeout".to_string(),
        };
        println!("{}\t{}\t{}", snapshot.id(), snapshot.logical_path(), size_text);
    }
    Ok(())
}
