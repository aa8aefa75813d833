//! Snapshot discovery, classification and writability toggling (spec
//! §4.D). Grounded on the teacher's trait-object dispatch shape in
//! `component.rs` (`new_from_name`/`Box<dyn Component>`), adapted to
//! two discovery *patterns* rather than two installable components.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset, Local, NaiveDateTime, TimeZone, Utc};
use fn_error_context::context;

use crate::filesystem::{self, Filesystem, Subvolume};
use crate::runner::Runner;

/// Optional metadata from a sidecar `info.xml`-shaped descriptor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnapshotDescriptor {
    pub number: u64,
    pub description: String,
    pub snapshot_type: String,
}

#[derive(Clone, Debug)]
pub struct Snapshot {
    pub subvolume: Subvolume,
    pub time: DateTime<FixedOffset>,
    /// Absolute path usable for I/O and subvolume operations.
    pub filesystem_path: PathBuf,
    pub descriptor: Option<SnapshotDescriptor>,
}

impl Snapshot {
    /// The forward-slash logical path used in boot entries, e.g.
    /// `@/.snapshots/42/snapshot`. Distinct from `filesystem_path` per
    /// spec invariant.
    pub fn logical_path(&self) -> &str {
        &self.subvolume.path
    }

    pub fn id(&self) -> u64 {
        self.subvolume.id
    }
}

const SNAPSHOT_NAME_PATTERNS: &[&str] = &[".snapshots/", "/snapshot"];

fn path_looks_like_snapshot(path: &str) -> bool {
    SNAPSHOT_NAME_PATTERNS.iter().any(|p| path.contains(p))
}

/// "Is-snapshot of the given root" (spec §4.D).
fn is_snapshot_of_root(candidate: &Subvolume, root: Option<&Subvolume>, search_roots: &[PathBuf], candidate_path: &Path) -> bool {
    if let Some(root) = root {
        if candidate.is_snapshot {
            if candidate.parent_id == root.id || candidate.parent_id == root.parent_id {
                return true;
            }
        }
        let heuristic = path_looks_like_snapshot(&candidate.path)
            || search_roots.iter().any(|r| candidate_path.starts_with(r));
        heuristic && candidate.generation <= root.generation
    } else {
        path_looks_like_snapshot(&candidate.path)
    }
}

fn parse_sidecar_timestamp(s: &str) -> Option<DateTime<FixedOffset>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt);
    }
    // `YYYY-MM-DD HH:MM:SS` with optional trailing `±HHMM`.
    if let Some((naive_part, offset_part)) = s.rsplit_once(' ') {
        if (offset_part.starts_with('+') || offset_part.starts_with('-')) && offset_part.len() == 5 {
            if let Ok(naive) = NaiveDateTime::parse_from_str(naive_part, "%Y-%m-%d %H:%M:%S") {
                let sign = if offset_part.starts_with('-') { -1 } else { 1 };
                let hours: i32 = offset_part[1..3].parse().ok()?;
                let mins: i32 = offset_part[3..5].parse().ok()?;
                let secs = sign * (hours * 3600 + mins * 60);
                let offset = FixedOffset::east_opt(secs)?;
                return Some(offset.from_local_datetime(&naive).single()?);
            }
        }
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Some(DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc).fixed_offset());
    }
    None
}

#[context("reading mtime of {}", path.display())]
fn mtime_as_datetime(path: &Path) -> Result<DateTime<FixedOffset>> {
    let meta = std::fs::metadata(path)?;
    let modified = meta.modified()?;
    Ok(DateTime::<Utc>::from(modified).fixed_offset())
}

/// A single discovered candidate before `Snapshot` construction.
struct Candidate {
    subvolume_path: PathBuf,
    descriptor: Option<SnapshotDescriptor>,
    descriptor_time: Option<DateTime<FixedOffset>>,
}

fn walk_for_candidates(root: &Path, max_depth: usize) -> Vec<Candidate> {
    let mut out = Vec::new();
    for entry in walkdir::WalkDir::new(root)
        .max_depth(max_depth)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_dir() {
            continue;
        }
        let dir = entry.path();

        // Sidecar pattern: a directory containing both `snapshot/` and `info.xml`.
        let snap_subdir = dir.join("snapshot");
        let info_xml = dir.join("info.xml");
        if snap_subdir.is_dir() && info_xml.is_file() {
            let descriptor = std::fs::read_to_string(&info_xml)
                .ok()
                .and_then(|xml| parse_info_xml(&xml));
            let descriptor_time = descriptor.as_ref().and_then(|_| {
                std::fs::read_to_string(&info_xml)
                    .ok()
                    .and_then(|xml| extract_xml_field(&xml, "date"))
                    .and_then(|s| parse_sidecar_timestamp(&s))
            });
            out.push(Candidate {
                subvolume_path: snap_subdir,
                descriptor,
                descriptor_time,
            });
            continue;
        }

        // Direct pattern: any subdirectory that is itself a subvolume
        // (checked by the caller via `filesystem::show`) and whose
        // name matches a recognised snapshot pattern.
        if path_looks_like_snapshot(&dir.to_string_lossy()) {
            out.push(Candidate {
                subvolume_path: dir.to_path_buf(),
                descriptor: None,
                descriptor_time: None,
            });
        }
    }
    out
}

fn parse_info_xml(xml: &str) -> Option<SnapshotDescriptor> {
    let number = extract_xml_field(xml, "num")?.parse().ok()?;
    let description = extract_xml_field(xml, "description").unwrap_or_default();
    let snapshot_type = extract_xml_field(xml, "type").unwrap_or_default();
    Some(SnapshotDescriptor {
        number,
        description,
        snapshot_type,
    })
}

fn extract_xml_field(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)? + start;
    Some(xml[start..end].trim().to_string())
}

/// Discover snapshots of `filesystem`'s root subvolume under
/// `search_roots` (resolved against the mount point if relative), to
/// `max_depth`. Returned sorted newest-first.
pub fn discover(filesystem: &Filesystem, search_roots: &[PathBuf], max_depth: usize) -> Result<Vec<Snapshot>> {
    let resolved_roots: Vec<PathBuf> = search_roots
        .iter()
        .map(|r| {
            if r.is_relative() {
                filesystem.mount_point.join(r)
            } else {
                r.clone()
            }
        })
        .collect();

    let mut snapshots = Vec::new();
    for root in &resolved_roots {
        if !root.is_dir() {
            continue;
        }
        for candidate in walk_for_candidates(root, max_depth) {
            let subvolume = match filesystem::show(&candidate.subvolume_path) {
                Ok(sv) => sv,
                Err(e) => {
                    log::warn!("skipping {:?}: {e:#}", candidate.subvolume_path);
                    continue;
                }
            };
            if !is_snapshot_of_root(
                &subvolume,
                Some(&filesystem.root_subvolume),
                &resolved_roots,
                &candidate.subvolume_path,
            ) {
                continue;
            }
            let time = candidate
                .descriptor_time
                .or(Some(subvolume.created_at))
                .unwrap_or(subvolume.created_at);
            let time = if candidate.descriptor.is_some() && candidate.descriptor_time.is_none() {
                mtime_as_datetime(&candidate.subvolume_path).unwrap_or(time)
            } else {
                time
            };
            snapshots.push(Snapshot {
                subvolume,
                time,
                filesystem_path: candidate.subvolume_path,
                descriptor: candidate.descriptor,
            });
        }
    }
    snapshots.sort_by(|a, b| b.time.cmp(&a.time));
    Ok(snapshots)
}

/// Toggle mode: flip `ro` on the selection, restore it on every
/// deselected snapshot whose flag is currently `true` (Scenario 1).
/// `cleanup` gates the restore pass (`behavior.cleanup_old_snapshots`).
pub fn toggle_writability(runner: &dyn Runner, all: &[Snapshot], selection: &[&Snapshot], cleanup: bool) -> Result<()> {
    let selected_ids: std::collections::HashSet<u64> = selection.iter().map(|s| s.id()).collect();

    for snap in selection {
        if snap.subvolume.is_read_only {
            filesystem::set_readonly(runner, &snap.filesystem_path, false)
                .with_context(|| format!("making snapshot {} writable", snap.id()))?;
        }
    }
    if !cleanup {
        return Ok(());
    }
    for snap in all {
        if !selected_ids.contains(&snap.id()) && snap.subvolume.is_read_only == false {
            // Only restore snapshots this tool previously flipped; a
            // snapshot that was never writable needs no cleanup. We
            // conservatively restore any deselected snapshot we
            // observe as writable, matching spec Scenario 1's cleanup
            // pass.
            filesystem::set_readonly(runner, &snap.filesystem_path, true)
                .with_context(|| format!("restoring snapshot {} to read-only", snap.id()))?;
        }
    }
    Ok(())
}

/// Copy mode: create a writable sibling under `destination_dir`, prune
/// old ones beyond `retention`.
pub fn copy_writable(
    runner: &dyn Runner,
    snapshot: &Snapshot,
    destination_dir: &Path,
    timestamp_format: &str,
    retention: usize,
    local_time: bool,
    cleanup: bool,
) -> Result<PathBuf> {
    runner.mkdir_all(destination_dir, 0o755, "creating writable-snapshot destination directory")?;
    let formatted_time = if local_time {
        snapshot.time.with_timezone(&Local).format(timestamp_format).to_string()
    } else {
        snapshot.time.format(timestamp_format).to_string()
    };
    let name = format!("rwsnap_{formatted_time}_ID{}", snapshot.id());
    let dest = destination_dir.join(&name);

    filesystem::snapshot_subvolume(runner, &snapshot.filesystem_path, &dest)?;
    filesystem::set_readonly(runner, &dest, false)?;

    if cleanup {
        prune_old_rwsnaps(runner, destination_dir, retention)?;
    }
    Ok(dest)
}

fn prune_old_rwsnaps(runner: &dyn Runner, destination_dir: &Path, retention: usize) -> Result<()> {
    let mut names: Vec<String> = std::fs::read_dir(destination_dir)?
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|n| n.starts_with("rwsnap_"))
        .collect();
    names.sort();
    if names.len() > retention {
        for name in &names[..names.len() - retention] {
            let path = destination_dir.join(name);
            log::info!("pruning old writable snapshot {}", path.display());
            if let Err(e) = filesystem::delete_subvolume(runner, &path) {
                log::warn!("failed to prune {}: {e:#}", path.display());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::cell::RefCell;

    /// Records every `command()` invocation instead of running it, so
    /// tests can assert on exactly which mutations a call performed.
    #[derive(Default)]
    struct RecordingRunner {
        calls: RefCell<Vec<(String, Vec<String>)>>,
    }

    impl Runner for RecordingRunner {
        fn command(&self, name: &str, args: &[&str], _description: &str) -> Result<()> {
            self.calls.borrow_mut().push((name.to_string(), args.iter().map(|a| a.to_string()).collect()));
            Ok(())
        }
        fn write_file(&self, _path: &Path, _bytes: &[u8], _mode: u32, _description: &str) -> Result<()> {
            Ok(())
        }
        fn mkdir_all(&self, _path: &Path, _mode: u32, _description: &str) -> Result<()> {
            Ok(())
        }
        fn is_dry_run(&self) -> bool {
            false
        }
    }

    fn make_snapshot(id: u64, path: &str, read_only: bool) -> Snapshot {
        Snapshot {
            subvolume: Subvolume {
                id,
                path: path.to_string(),
                parent_id: 5,
                generation: 10,
                created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap().fixed_offset(),
                is_snapshot: true,
                is_read_only: read_only,
            },
            time: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap().fixed_offset(),
            filesystem_path: PathBuf::from(format!("/.snapshots/{id}/snapshot")),
            descriptor: None,
        }
    }

    #[test]
    fn path_heuristic_recognises_snapshot_dirs() {
        assert!(path_looks_like_snapshot("@/.snapshots/8/snapshot"));
        assert!(!path_looks_like_snapshot("@/home"));
    }

    #[test]
    fn sidecar_timestamp_with_offset_parses() {
        let dt = parse_sidecar_timestamp("2024-03-01 10:15:30 +0200").unwrap();
        assert_eq!(dt.to_utc().format("%H:%M:%S").to_string(), "08:15:30");
    }

    #[test]
    fn sidecar_timestamp_plain_parses() {
        assert!(parse_sidecar_timestamp("2024-03-01 10:15:30").is_some());
    }

    #[test]
    fn info_xml_field_extraction() {
        let xml = "<snapshot><num>42</num><date>2024-01-01 00:00:00</date><description>pre update</description><type>single</type></snapshot>";
        let d = parse_info_xml(xml).unwrap();
        assert_eq!(d.number, 42);
        assert_eq!(d.description, "pre update");
        assert_eq!(d.snapshot_type, "single");
    }

    #[test]
    fn discovery_sorts_newest_first() {
        let mut snaps = vec![make_snapshot(1, "@/.snapshots/1/snapshot", true), make_snapshot(2, "@/.snapshots/2/snapshot", true)];
        snaps[0].time = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap().fixed_offset();
        snaps[1].time = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap().fixed_offset();
        snaps.sort_by(|a, b| b.time.cmp(&a.time));
        assert_eq!(snaps[0].id(), 2);
    }

    /// Scenario 1: a single read-only snapshot is selected and made
    /// writable; every other read-only snapshot is left alone, and a
    /// previously-writable, deselected snapshot is restored to
    /// read-only on the same pass.
    #[test]
    fn toggle_writability_flips_selection_and_restores_leftovers() {
        let selected = make_snapshot(1, "@/.snapshots/1/snapshot", true);
        let untouched = make_snapshot(2, "@/.snapshots/2/snapshot", true);
        let leftover_writable = make_snapshot(3, "@/.snapshots/3/snapshot", false);
        let all = vec![selected.clone(), untouched, leftover_writable];

        let runner = RecordingRunner::default();
        toggle_writability(&runner, &all, &[&selected], true).unwrap();

        let calls = runner.calls.borrow();
        assert_eq!(calls.len(), 2);

        let (name, args) = &calls[0];
        assert_eq!(name, "btrfs");
        assert_eq!(args, &vec!["property", "set", "-ts", "/.snapshots/1/snapshot", "ro", "false"]);

        let (name, args) = &calls[1];
        assert_eq!(name, "btrfs");
        assert_eq!(args, &vec!["property", "set", "-ts", "/.snapshots/3/snapshot", "ro", "true"]);
    }
}
