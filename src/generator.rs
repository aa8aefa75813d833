//! Generator (spec §4.I): produces `FileDiff`s for the per-kernel
//! sidecar rewrite, the main-config rewrite/template, and the
//! snapshot-specific `rootflags` rewrite shared by both. Never writes
//! directly; every function here returns `(path, original, modified)`
//! for the Patch Aggregator to collect.

use std::path::Path;

use std::sync::OnceLock;

use regex::Regex;

use crate::bootconfig::main_config::{self, MainConfig, RenderedSubmenu};
use crate::bootconfig::sidecar::{self, SidecarLine};
use crate::fstab;
use crate::params::BootOptionsParser;
use crate::patch::FileDiff;
use crate::snapshot::Snapshot;

const MARKER_START: &str = "##refind-btrfs-snapshots-start";
const MARKER_END: &str = "##refind-btrfs-snapshots-end";

fn legacy_timestamp_title() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\(\d{4}-\d{2}-\d{2}[^)]*\)\s*$").unwrap())
}

fn snapshot_display_name(snapshot: &Snapshot) -> String {
    match &snapshot.descriptor {
        Some(d) if !d.description.is_empty() => format!("#{} {}", d.number, d.description),
        Some(d) => format!("#{}", d.number),
        None => snapshot.time.format("%Y-%m-%d %H:%M:%S").to_string(),
    }
}

/// The snapshot option rewrite (spec §4.I "Snapshot option rewrite"):
/// detect the `@`/`/@` convention from the source options, point
/// `rootflags`'s `subvol=`/`subvolid=` at the snapshot, leave every
/// other parameter — including repeated `initrd=` entries and their
/// order — untouched.
pub fn rewrite_snapshot_options(source_options: &str, snapshot: &Snapshot) -> String {
    let current_subvol = BootOptionsParser::extract_rootflags_field(source_options, "subvol");
    let prefix = fstab::subvol_prefix(&current_subvol);
    let new_subvol = format!("{prefix}{}", snapshot.logical_path().trim_start_matches('@'));
    let updated = BootOptionsParser::update_rootflags_field(source_options, "subvol", &new_subvol);
    BootOptionsParser::update_rootflags_field(&updated, "subvolid", &snapshot.id().to_string())
}

/// Remove the existing managed region (marker-delimited, or matching
/// the legacy timestamp-suffixed-title shape) from a sidecar's lines,
/// returning what's left.
fn strip_managed_region(lines: &[&str]) -> Vec<String> {
    let start = lines.iter().position(|l| l.trim() == MARKER_START);
    let end = lines.iter().position(|l| l.trim() == MARKER_END);
    if let (Some(start), Some(end)) = (start, end) {
        if start <= end {
            return lines[..start]
                .iter()
                .chain(lines[end + 1..].iter())
                .map(|l| l.to_string())
                .collect();
        }
    }

    // Legacy shape: drop any well-formed sidecar line whose title ends
    // with a parenthesised timestamp.
    lines
        .iter()
        .filter(|line| {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                return true;
            }
            match sidecar::parse_quoted_string(trimmed) {
                Some(title) => !legacy_timestamp_title().is_match(&title),
                None => true,
            }
        })
        .map(|l| l.to_string())
        .collect()
}

/// Rewrite one sidecar file: `source_entries` are this file's original
/// (non-generated) `"title" "options"` lines, in file order.
pub fn rewrite_sidecar(path: &Path, original_text: &str, source_entries: &[SidecarLine], snapshots: &[Snapshot]) -> FileDiff {
    let lines: Vec<&str> = original_text.lines().collect();
    let retained = strip_managed_region(&lines);

    let mut out = retained.join("\n");
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(MARKER_START);
    out.push('\n');
    for entry in source_entries {
        for snapshot in snapshots {
            let rewritten = SidecarLine {
                title: format!("{} ({})", entry.title, snapshot_display_name(snapshot)),
                options: rewrite_snapshot_options(&entry.options, snapshot),
            };
            out.push_str(&sidecar::render_line(&rewritten));
            out.push('\n');
        }
    }
    out.push_str(MARKER_END);
    out.push('\n');

    FileDiff {
        path: path.to_path_buf(),
        original: Some(original_text.to_string()),
        modified: out,
    }
}

fn entry_options(entry: &main_config::MenuEntryBlock) -> Option<String> {
    entry.attribute_lines.iter().find_map(|line| {
        let rest = line.trim().strip_prefix("options")?.trim();
        sidecar::parse_quoted_string(rest)
    })
}

/// Render one config file's global lines plus its `menuentry` blocks
/// with freshly-generated submenus, shared by the top-level main
/// config and any file it `include`s.
fn render_config_file(path: &Path, original_text: &str, config: &MainConfig, snapshots: &[Snapshot]) -> FileDiff {
    let mut out = String::new();
    for line in &config.global_lines {
        out.push_str(line);
        out.push('\n');
    }
    for entry in &config.entries {
        let submenus: Vec<RenderedSubmenu> = match entry_options(entry) {
            Some(options) => snapshots
                .iter()
                .map(|snapshot| RenderedSubmenu {
                    title: snapshot_display_name(snapshot),
                    options: rewrite_snapshot_options(&options, snapshot),
                })
                .collect(),
            None => {
                log::warn!("menuentry {:?} has no options line; leaving its submenus empty", entry.title);
                Vec::new()
            }
        };
        out.push_str(&main_config::render_menu_entry(entry, &submenus));
    }

    FileDiff {
        path: path.to_path_buf(),
        original: Some(original_text.to_string()),
        modified: out,
    }
}

/// Rewrite (or create) the main config file, plus any file it
/// `include`s that itself holds `menuentry` blocks (spec §4.H) — each
/// included file is rewritten in place, one level deep. `original_text`
/// is `None` when the managed file doesn't exist yet, in which case an
/// inert disabled template is emitted instead and no includes are
/// followed.
pub fn rewrite_main_config(path: &Path, original_text: Option<&str>, template_title: &str, snapshots: &[Snapshot]) -> Vec<FileDiff> {
    let Some(original_text) = original_text else {
        return vec![FileDiff {
            path: path.to_path_buf(),
            original: None,
            modified: main_config::render_template(template_title),
        }];
    };

    let config = match MainConfig::parse(original_text) {
        Ok(c) => c,
        Err(e) => {
            log::error!("failed to parse main config {}: {e:#}", path.display());
            return vec![FileDiff {
                path: path.to_path_buf(),
                original: Some(original_text.to_string()),
                modified: original_text.to_string(),
            }];
        }
    };

    let mut diffs = vec![render_config_file(path, original_text, &config, snapshots)];
    if let Some(base_dir) = path.parent() {
        for (include_path, include_text, include_config) in main_config::resolve_includes(base_dir, &config) {
            diffs.push(render_config_file(&include_path, &include_text, &include_config, snapshots));
        }
    }
    diffs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filesystem::Subvolume;
    use chrono::{TimeZone, Utc};

    fn snap(id: u64, path: &str) -> Snapshot {
        Snapshot {
            subvolume: Subvolume {
                id,
                path: path.to_string(),
                parent_id: 5,
                generation: 1,
                created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap().fixed_offset(),
                is_snapshot: true,
                is_read_only: true,
            },
            time: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap().fixed_offset(),
            filesystem_path: path.into(),
            descriptor: None,
        }
    }

    #[test]
    fn snapshot_option_rewrite_preserves_at_prefix_and_updates_ids() {
        let options = "root=UUID=1111 rw rootflags=subvol=/@,subvolid=256 quiet";
        let rewritten = rewrite_snapshot_options(options, &snap(275, "@/.snapshots/8/snapshot"));
        assert!(rewritten.contains("subvol=/@/.snapshots/8/snapshot"));
        assert!(rewritten.contains("subvolid=275"));
        assert!(rewritten.contains("quiet"));
    }

    #[test]
    fn sidecar_rewrite_appends_marked_region_once() {
        let entries = vec![SidecarLine {
            title: "Arch Linux".to_string(),
            options: "root=UUID=1111 rw rootflags=subvol=@,subvolid=5".to_string(),
        }];
        let snapshots = vec![snap(8, "@/.snapshots/8/snapshot"), snap(7, "@/.snapshots/7/snapshot")];
        let diff = rewrite_sidecar(Path::new("/boot/loader/entries/arch.conf"), "\"Arch Linux\" \"root=UUID=1111 rw\"\n", &entries, &snapshots);
        assert_eq!(diff.modified.matches(MARKER_START).count(), 1);
        assert_eq!(diff.modified.matches(MARKER_END).count(), 1);
        let marker_pos = diff.modified.find(MARKER_START).unwrap();
        let first_pos = diff.modified.find("subvolid=8").unwrap();
        let second_pos = diff.modified.find("subvolid=7").unwrap();
        assert!(marker_pos < first_pos);
        assert!(marker_pos < second_pos);
    }

    #[test]
    fn rerunning_sidecar_rewrite_on_its_own_output_is_idempotent() {
        let entries = vec![SidecarLine {
            title: "Arch Linux".to_string(),
            options: "root=UUID=1111 rw rootflags=subvol=@,subvolid=5".to_string(),
        }];
        let snapshots = vec![snap(8, "@/.snapshots/8/snapshot")];
        let first = rewrite_sidecar(Path::new("/x"), "\"Arch Linux\" \"root=UUID=1111 rw\"\n", &entries, &snapshots);
        let second = rewrite_sidecar(Path::new("/x"), &first.modified, &entries, &snapshots);
        assert_eq!(first.modified, second.modified);
    }

    #[test]
    fn legacy_timestamp_titles_are_stripped_without_markers() {
        let text = "\"Arch Linux (2023-05-01)\" \"root=UUID=1111 rw\"\n\"Arch Linux\" \"root=UUID=1111 rw\"\n";
        let lines: Vec<&str> = text.lines().collect();
        let retained = strip_managed_region(&lines);
        assert_eq!(retained.len(), 1);
        assert!(retained[0].contains("Arch Linux\""));
    }

    #[test]
    fn missing_main_config_emits_inert_template() {
        let diffs = rewrite_main_config(Path::new("/boot/EFI/BOOT/main.conf"), None, "Linux snapshots", &[]);
        assert_eq!(diffs.len(), 1);
        assert!(diffs[0].is_new());
        assert!(diffs[0].modified.contains("disabled"));
    }

    #[test]
    fn rewrite_main_config_also_rewrites_menuentries_from_an_included_file() {
        let td = tempfile::tempdir().unwrap();
        let main_path = td.path().join("main.conf");
        std::fs::write(
            &main_path,
            "include other.conf\nmenuentry \"Linux\" {\n\tloader /boot/vmlinuz-linux\n\toptions \"root=UUID=1111 rw rootflags=subvol=@\"\n}\n",
        )
        .unwrap();
        std::fs::write(
            td.path().join("other.conf"),
            "menuentry \"Other\" {\n\tloader /boot/vmlinuz-other\n\toptions \"root=UUID=1111 rw rootflags=subvol=@\"\n}\n",
        )
        .unwrap();
        let original = std::fs::read_to_string(&main_path).unwrap();
        let snapshots = vec![snap(8, "@/.snapshots/8/snapshot")];
        let diffs = rewrite_main_config(&main_path, Some(&original), "Linux snapshots", &snapshots);

        assert_eq!(diffs.len(), 2);
        assert_eq!(diffs[0].path, main_path);
        assert!(diffs[0].modified.contains("menuentry \"Linux\""));
        assert!(diffs[0].modified.contains("subvol=/@/.snapshots/8/snapshot"));

        assert_eq!(diffs[1].path, td.path().join("other.conf"));
        assert!(diffs[1].modified.contains("menuentry \"Other\""));
        assert!(diffs[1].modified.contains("subvol=/@/.snapshots/8/snapshot"));
    }
}
