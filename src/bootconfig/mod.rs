//! Bootloader Config Model (spec §4.H): the main rEFInd-style config
//! file (`menuentry`/`submenuentry` blocks) and the per-kernel sidecar
//! format it can delegate to. Grounded on the teacher's `grubconfigs`
//! module's line-oriented, directive-recognising parse loop.

pub mod main_config;
pub mod sidecar;

use std::path::{Path, PathBuf};

/// Search order for the main config file: first existing path wins.
pub fn config_path_search_order(root: &Path, vendor: &str) -> Vec<PathBuf> {
    vec![
        root.join("EFI").join(vendor).join("main.conf"),
        root.join("EFI/BOOT/main.conf"),
        root.join("main.conf"),
        root.join("EFI").join(vendor).join("refind.conf"),
    ]
}

pub fn find_config_path(root: &Path, vendor: &str) -> Option<PathBuf> {
    config_path_search_order(root, vendor).into_iter().find(|p| p.is_file())
}
