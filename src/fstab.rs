//! Mount-table parsing, analysis and fidelity-preserving rewriting
//! (spec §4.C). Grounded on the teacher's line-oriented, `bail!`-on-
//! malformed-input parsing style (`packagesystem::rpm_parse_metadata`)
//! adapted to mount-table columns.

use std::path::Path;

use anyhow::{Context, Result};

use crate::device::{DeviceSpec, Identifiers};
use crate::params::ParamParser;

/// One non-comment, non-blank line of an fstab, plus the exact
/// original text it was parsed from (spec invariant: "every entry
/// stores the exact original line").
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FstabEntry {
    pub device: String,
    pub mount_point: String,
    pub fstype: String,
    pub options: String,
    pub dump: String,
    pub pass: String,
    pub original_line: String,
}

/// A raw line of the file: either a data line (index into `entries`)
/// or verbatim text (blank/comment) to be re-emitted unchanged.
#[derive(Clone, Debug)]
enum Line {
    Verbatim(String),
    Entry(usize),
}

#[derive(Clone, Debug, Default)]
pub struct Fstab {
    lines: Vec<Line>,
    pub entries: Vec<FstabEntry>,
    trailing_newline: bool,
}

impl Fstab {
    pub fn parse(text: &str) -> Result<Self> {
        let mut fstab = Fstab {
            trailing_newline: text.ends_with('\n'),
            ..Fstab::default()
        };
        for raw_line in text.lines() {
            let trimmed = raw_line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                fstab.lines.push(Line::Verbatim(raw_line.to_string()));
                continue;
            }
            let fields: Vec<&str> = raw_line.split_whitespace().collect();
            if fields.len() < 4 {
                anyhow::bail!("fstab line has fewer than 4 fields: {raw_line:?}");
            }
            let entry = FstabEntry {
                device: fields[0].to_string(),
                mount_point: fields[1].to_string(),
                fstype: fields[2].to_string(),
                options: fields[3].to_string(),
                dump: fields.get(4).unwrap_or(&"0").to_string(),
                pass: fields.get(5).unwrap_or(&"0").to_string(),
                original_line: raw_line.to_string(),
            };
            fstab.entries.push(entry);
            fstab.lines.push(Line::Entry(fstab.entries.len() - 1));
        }
        Ok(fstab)
    }

    pub fn read(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading fstab {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing fstab {}", path.display()))
    }

    /// Rewrite the file, replacing only the options column of entries
    /// whose `original_line` is in `modified` (identified by original
    /// line identity, per spec). Preserves column alignment by
    /// replacing only the options substring in-place; falls back to a
    /// tab-joined reformat if the options column's boundaries can't be
    /// located unambiguously.
    pub fn rewrite(&self, modified: &[(&FstabEntry, String)]) -> String {
        let modified_by_line: std::collections::HashMap<&str, &str> = modified
            .iter()
            .map(|(e, new_opts)| (e.original_line.as_str(), new_opts.as_str()))
            .collect();

        let mut out = String::new();
        for (i, line) in self.lines.iter().enumerate() {
            if i > 0 {
                out.push('\n');
            }
            match line {
                Line::Verbatim(text) => out.push_str(text),
                Line::Entry(idx) => {
                    let entry = &self.entries[*idx];
                    if let Some(new_opts) = modified_by_line.get(entry.original_line.as_str()) {
                        out.push_str(&Self::rewrite_options_column(entry, new_opts));
                    } else {
                        out.push_str(&entry.original_line);
                    }
                }
            }
        }
        if self.trailing_newline {
            out.push('\n');
        }
        out
    }

    /// Replace just the options field within `entry.original_line`,
    /// preserving the whitespace before and after it. Falls back to a
    /// tab-joined reformat if the options text can't be found as a
    /// distinct whitespace-delimited column (e.g. it's a substring of
    /// another field too, which whitespace-splitting rules out).
    fn rewrite_options_column(entry: &FstabEntry, new_options: &str) -> String {
        let line = &entry.original_line;
        // Re-derive column boundaries the same way parsing did, so we
        // replace exactly the token `split_whitespace` identified as
        // the options field (the 4th column).
        let mut column_start = None;
        let mut column_end = None;
        let mut col_idx = 0usize;
        let mut chars = line.char_indices().peekable();
        let mut in_token = false;
        let mut token_start = 0usize;
        while let Some((i, c)) = chars.next() {
            if c.is_whitespace() {
                if in_token {
                    if col_idx == 3 {
                        column_start = Some(token_start);
                        column_end = Some(i);
                        break;
                    }
                    col_idx += 1;
                    in_token = false;
                }
            } else if !in_token {
                in_token = true;
                token_start = i;
            }
        }
        if column_start.is_none() && in_token && col_idx == 3 {
            column_start = Some(token_start);
            column_end = Some(line.len());
        }

        match (column_start, column_end) {
            (Some(start), Some(end)) => {
                let mut out = String::with_capacity(line.len());
                out.push_str(&line[..start]);
                out.push_str(new_options);
                out.push_str(&line[end..]);
                out
            }
            _ => [
                entry.device.as_str(),
                entry.mount_point.as_str(),
                entry.fstype.as_str(),
                new_options,
                entry.dump.as_str(),
                entry.pass.as_str(),
            ]
            .join("\t"),
        }
    }

    /// Entries whose `mount_point == "/"`, `fstype` matches the target
    /// cow filesystem, and whose device matches `root_identifiers`.
    pub fn root_entries<'a>(&'a self, cow_fstype: &str, root_identifiers: &Identifiers) -> Vec<&'a FstabEntry> {
        self.entries
            .iter()
            .filter(|e| {
                e.mount_point == "/"
                    && e.fstype == cow_fstype
                    && root_identifiers.matches(&DeviceSpec::parse(&e.device))
            })
            .collect()
    }

    /// Rewrite a root entry's `subvol=`/`subvolid=` to point at
    /// `snapshot_path`/`snapshot_id`, preserving the caller's `@` vs
    /// `/@` prefix convention (spec §9: first occurrence wins).
    pub fn options_for_snapshot(entry: &FstabEntry, snapshot_path: &str, snapshot_id: u64) -> String {
        let parser = ParamParser::comma();
        let current_subvol = parser.extract(&entry.options, "subvol");
        let prefix = subvol_prefix(&current_subvol);
        let new_subvol = format!("{prefix}{}", snapshot_path.trim_start_matches('@'));
        let updated = parser.update(&entry.options, "subvol", &new_subvol);
        parser.update(&updated, "subvolid", &snapshot_id.to_string())
    }

    pub fn analyze_boot_mount(&self, cow_fstype: &str, root_identifiers: Option<&Identifiers>) -> BootMountInfo {
        let boot_entry = self
            .entries
            .iter()
            .find(|e| e.mount_point == "/boot");

        let Some(entry) = boot_entry else {
            return BootMountInfo {
                has_separate_boot_mount: false,
                boot_on_same_cow_fs: true,
                entry: None,
            };
        };

        if entry.fstype != cow_fstype {
            return BootMountInfo {
                has_separate_boot_mount: true,
                boot_on_same_cow_fs: false,
                entry: Some(entry.clone()),
            };
        }

        let same = match root_identifiers {
            Some(ids) => ids.matches(&DeviceSpec::parse(&entry.device)),
            None => false,
        };
        BootMountInfo {
            has_separate_boot_mount: true,
            boot_on_same_cow_fs: same,
            entry: Some(entry.clone()),
        }
    }
}

/// Returns the `@`-or-`/@` prefix convention used by an existing
/// `subvol=` value. Spec §9 open question: when a string somehow
/// contains both forms, the first occurrence is treated as the
/// convention; `find` naturally implements "first occurrence" here
/// since `/@` and `@` are mutually exclusive prefixes of one string.
pub(crate) fn subvol_prefix(existing_subvol: &str) -> String {
    if existing_subvol.starts_with("/@") {
        "/@".to_string()
    } else {
        "@".to_string()
    }
}

#[derive(Clone, Debug)]
pub struct BootMountInfo {
    pub has_separate_boot_mount: bool,
    pub boot_on_same_cow_fs: bool,
    pub entry: Option<FstabEntry>,
}
