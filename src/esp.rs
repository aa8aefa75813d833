//! Boot-partition detector collaborator (spec §6): the core only ever
//! calls `find()` and `validate_path()`. Grounded on the teacher's
//! `efi::validate_esp`, which statfs's the candidate mount and checks
//! for the FAT magic; adapted here to `rustix` (already a dependency
//! of this crate) instead of `nix`.

use std::path::{Path, PathBuf};

use anyhow::{bail, Result};

use crate::device::Identifiers;

/// FAT12/16/32 magic as reported by `statfs(2)`'s `f_type`, aka `MSDOS_SUPER_MAGIC`.
const MSDOS_SUPER_MAGIC: i64 = 0x4d44;

pub trait EspDetector {
    fn find(&self) -> Result<(PathBuf, PathBuf, Identifiers)>;
    fn validate_path(&self, path: &Path) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct StatfsEspDetector;

impl EspDetector for StatfsEspDetector {
    fn find(&self) -> Result<(PathBuf, PathBuf, Identifiers)> {
        // Real firmware-partition discovery (enumerating GPT partition
        // type GUIDs and probing candidate mounts) is a heuristic the
        // core treats as an opaque external collaborator (spec §1);
        // here we resolve the conventional mount point and validate it.
        let mount_point = PathBuf::from("/boot/efi");
        self.validate_path(&mount_point)?;
        Ok((PathBuf::new(), mount_point, Identifiers::default()))
    }

    fn validate_path(&self, path: &Path) -> Result<()> {
        let stat = rustix::fs::statfs(path)?;
        if stat.f_type != MSDOS_SUPER_MAGIC {
            bail!(
                "{} is not a FAT filesystem (f_type={:#x})",
                path.display(),
                stat.f_type
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_fat_mount() {
        let td = tempfile::tempdir().unwrap();
        let detector = StatfsEspDetector;
        // A plain tempdir lives on the host tmpfs, never FAT.
        assert!(detector.validate_path(td.path()).is_err());
    }
}
