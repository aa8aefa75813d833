//! The runner capability set (§6, design note "Polymorphism for the
//! runner"): a small trait with a real and a dry-run implementation,
//! rather than an inheritance hierarchy.

use std::path::Path;
use std::process::Command;

use anyhow::{bail, Context, Result};
use openat_ext::OpenatDirExt;

pub trait Runner {
    fn command(&self, name: &str, args: &[&str], description: &str) -> Result<()>;
    fn write_file(&self, path: &Path, bytes: &[u8], mode: u32, description: &str) -> Result<()>;
    fn mkdir_all(&self, path: &Path, mode: u32, description: &str) -> Result<()>;
    fn is_dry_run(&self) -> bool;
}

#[derive(Debug, Default)]
pub struct RealRunner;

impl Runner for RealRunner {
    fn command(&self, name: &str, args: &[&str], description: &str) -> Result<()> {
        log::debug!("{description}: running {name} {args:?}");
        let status = Command::new(name)
            .args(args)
            .status()
            .with_context(|| format!("spawning {name}"))?;
        if !status.success() {
            bail!("{description}: {name} {args:?} exited with {status}");
        }
        Ok(())
    }

    fn write_file(&self, path: &Path, bytes: &[u8], mode: u32, description: &str) -> Result<()> {
        log::debug!("{description}: writing {} ({} bytes)", path.display(), bytes.len());
        let parent = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
        let file_name = path.file_name().ok_or_else(|| anyhow::anyhow!("no file name in {}", path.display()))?;
        let dir = openat::Dir::open(parent).with_context(|| format!("opening {}", parent.display()))?;
        dir.write_file_contents(Path::new(file_name), mode, bytes)
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }

    fn mkdir_all(&self, path: &Path, mode: u32, description: &str) -> Result<()> {
        log::debug!("{description}: mkdir -p {}", path.display());
        std::fs::create_dir_all(path).with_context(|| format!("mkdir {}", path.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
                .with_context(|| format!("chmod {}", path.display()))?;
        }
        Ok(())
    }

    fn is_dry_run(&self) -> bool {
        false
    }
}

#[derive(Debug, Default)]
pub struct DryRunRunner;

impl Runner for DryRunRunner {
    fn command(&self, name: &str, args: &[&str], description: &str) -> Result<()> {
        log::info!("[dry-run] {description}: would run {name} {args:?}");
        Ok(())
    }

    fn write_file(&self, path: &Path, bytes: &[u8], _mode: u32, description: &str) -> Result<()> {
        log::info!(
            "[dry-run] {description}: would write {} ({} bytes)",
            path.display(),
            bytes.len()
        );
        Ok(())
    }

    fn mkdir_all(&self, path: &Path, _mode: u32, description: &str) -> Result<()> {
        log::info!("[dry-run] {description}: would mkdir -p {}", path.display());
        Ok(())
    }

    fn is_dry_run(&self) -> bool {
        true
    }
}
