//! Filesystem/Subvolume data model (spec §3) and the subvolume-tool
//! collaborator (spec §6): shelling out to the cow-filesystem's native
//! `subvolume show <path>` and parsing its textual output. Grounded on
//! the teacher's `packagesystem::query_files`/`rpm_parse_metadata`
//! shell-out-then-parse shape.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, FixedOffset};

use crate::device::Identifiers;
use crate::runner::Runner;

/// A mounted copy-on-write root (spec §3). Holds its own identifier
/// bag and a reference to its root subvolume; never back-references a
/// `Snapshot` (design note: "cyclic references").
#[derive(Clone, Debug)]
pub struct Filesystem {
    pub mount_point: PathBuf,
    pub device: PathBuf,
    pub identifiers: Identifiers,
    pub root_subvolume: Subvolume,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Subvolume {
    pub id: u64,
    pub path: String,
    pub parent_id: u64,
    pub generation: u64,
    pub created_at: DateTime<FixedOffset>,
    pub is_snapshot: bool,
    pub is_read_only: bool,
}

/// The name of the native subvolume-management tool; a constant today,
/// but kept as a parameter of `show`/`set_readonly` so a future
/// multi-filesystem backend doesn't need to touch call sites.
pub const SUBVOLUME_TOOL: &str = "btrfs";

/// Invoke `<tool> subvolume show <path>` and parse its whitespace-
/// tolerant, colon-separated key/value output (spec §6).
pub fn show(path: &Path) -> Result<Subvolume> {
    let output = Command::new(SUBVOLUME_TOOL)
        .args(["subvolume", "show"])
        .arg(path)
        .output()
        .with_context(|| format!("running {SUBVOLUME_TOOL} subvolume show {}", path.display()))?;
    if !output.status.success() {
        bail!(
            "{SUBVOLUME_TOOL} subvolume show {} failed: {}",
            path.display(),
            String::from_utf8_lossy(&output.stderr)
        );
    }
    let text = String::from_utf8(output.stdout)
        .with_context(|| format!("decoding output of subvolume show {}", path.display()))?;
    parse_subvolume_show(&text).with_context(|| format!("parsing subvolume show for {}", path.display()))
}

/// Set or clear the read-only property on a subvolume, through
/// `runner` so dry-run mode can intercept the mutation.
pub fn set_readonly(runner: &dyn Runner, path: &Path, readonly: bool) -> Result<()> {
    let value = if readonly { "true" } else { "false" };
    let path_str = path.to_string_lossy().into_owned();
    runner.command(
        SUBVOLUME_TOOL,
        &["property", "set", "-ts", &path_str, "ro", value],
        &format!("setting ro={value} on {}", path.display()),
    )
}

/// Create a new subvolume at `dest` as a snapshot of `source`.
pub fn snapshot_subvolume(runner: &dyn Runner, source: &Path, dest: &Path) -> Result<()> {
    let source_str = source.to_string_lossy().into_owned();
    let dest_str = dest.to_string_lossy().into_owned();
    runner.command(
        SUBVOLUME_TOOL,
        &["subvolume", "snapshot", &source_str, &dest_str],
        &format!("snapshotting {} to {}", source.display(), dest.display()),
    )
}

/// Delete a subvolume. Best-effort: a failure is returned to the
/// caller to log, never panics.
pub fn delete_subvolume(runner: &dyn Runner, path: &Path) -> Result<()> {
    let path_str = path.to_string_lossy().into_owned();
    runner.command(SUBVOLUME_TOOL, &["subvolume", "delete", &path_str], &format!("deleting {}", path.display()))
}

fn parse_subvolume_show(text: &str) -> Result<Subvolume> {
    let mut fields: HashMap<String, String> = HashMap::new();
    let mut first_line_name: Option<String> = None;
    for (i, raw_line) in text.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }
        if i == 0 && !line.contains(':') {
            first_line_name = Some(line.to_string());
            continue;
        }
        if let Some((key, value)) = line.split_once(':') {
            fields.insert(key.trim().to_string(), value.trim().to_string());
        }
    }

    let get = |key: &str| -> Result<&str> {
        fields
            .get(key)
            .map(|s| s.as_str())
            .ok_or_else(|| anyhow::anyhow!("missing {key:?} in subvolume show output"))
    };

    let id: u64 = get("Subvolume ID")?.parse().context("parsing Subvolume ID")?;
    let parent_id: u64 = get("Parent ID")?.parse().context("parsing Parent ID")?;
    let generation: u64 = get("Generation")?.parse().context("parsing Generation")?;
    let flags = get("Flags").unwrap_or("").to_string();
    let created_raw = get("Creation time")?;
    let created_at = DateTime::parse_from_str(created_raw, "%Y-%m-%d %H:%M:%S %z")
        .with_context(|| format!("parsing Creation time {created_raw:?}"))?;
    let path = fields
        .get("Path")
        .cloned()
        .or(first_line_name)
        .ok_or_else(|| anyhow::anyhow!("missing Path in subvolume show output"))?;

    Ok(Subvolume {
        id,
        path,
        parent_id,
        generation,
        created_at,
        is_snapshot: flags.contains("snapshot"),
        is_read_only: flags.contains("readonly"),
    })
}
