//! Boot-Image Scanner (spec §4.E): glob-based discovery of
//! kernel/initramfs/microcode files under a boot partition, grouped
//! into per-kernel `BootSet`s, with best-effort binary sniffing.
//!
//! Grounded on the teacher's `Command`-plus-`serde_json` device-probing
//! shape in `bios.rs` for the "best effort, log and keep going on
//! failure" posture; the binary header layout itself comes from the
//! Linux boot protocol (`Documentation/x86/boot.rst`) and is new to
//! this crate.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fn_error_context::context;
use serde::{Deserialize, Serialize};

/// One glob pattern plus the role it plays when matched. Patterns are
/// tried in order; the first one to match a given file wins, so
/// `FallbackInitramfs` patterns must precede the plainer
/// `Initramfs` patterns they would otherwise shadow.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct PatternConfig {
    pub glob: String,
    pub role: ImageRole,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ImageRole {
    Kernel,
    Initramfs,
    FallbackInitramfs,
    Microcode,
}

impl PatternConfig {
    /// The built-in default list. Order matters: fallback patterns are
    /// listed before the plain patterns they'd otherwise be shadowed
    /// by (e.g. `initramfs-*-fallback.img` before `initramfs-*.img`).
    pub fn defaults() -> Vec<PatternConfig> {
        vec![
            PatternConfig {
                glob: "*-ucode.img".to_string(),
                role: ImageRole::Microcode,
            },
            PatternConfig {
                glob: "vmlinuz-*".to_string(),
                role: ImageRole::Kernel,
            },
            PatternConfig {
                glob: "initramfs-*-fallback.img".to_string(),
                role: ImageRole::FallbackInitramfs,
            },
            PatternConfig {
                glob: "initramfs-*.img".to_string(),
                role: ImageRole::Initramfs,
            },
        ]
    }
}

/// A kernel's inspected identity, read best-effort from its binary header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InspectedKernel {
    pub boot_protocol_version: String,
    pub full_version: Option<String>,
    pub short_version: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BootImage {
    /// Relative to the boot-partition root, forward-slash normalised.
    pub esp_relative_path: String,
    pub role: ImageRole,
    /// The `*` capture from whichever glob matched, e.g. `linux-lts`
    /// from `vmlinuz-linux-lts`. Empty for microcode images.
    pub kernel_name: String,
    pub inspected: Option<InspectedKernel>,
    pub compression: Option<Compression>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Compression {
    Xz,
    Zstd,
    Lz4,
    Gzip,
    GzipOld,
    Bzip2,
    Lzma,
    Cpio,
    Unknown,
}

/// A kernel paired with its initramfs(es) and the microcode images
/// shared across all sets, as grouped by `build_boot_sets`.
#[derive(Clone, Debug, Default)]
pub struct BootSet {
    pub kernel_name: String,
    pub kernel: Option<BootImage>,
    pub initramfs: Option<BootImage>,
    pub fallback_initramfs: Option<BootImage>,
    pub microcode: Vec<BootImage>,
}

impl BootSet {
    pub fn is_empty(&self) -> bool {
        self.kernel.is_none() && self.initramfs.is_none() && self.fallback_initramfs.is_none()
    }
}

const HDRS_MAGIC: u32 = 0x5372_6448; // "HdrS" little-endian
const HDRS_OFFSET: u64 = 0x202;
const VERSION_OFFSET: u64 = 0x206;
const VERSION_PTR_OFFSET: u64 = 0x20E;

#[context("reading kernel header of {}", path.display())]
fn read_kernel_header(path: &Path) -> Result<Option<InspectedKernel>> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    if len < 0x210 {
        return Ok(None);
    }

    file.seek(SeekFrom::Start(HDRS_OFFSET))?;
    let mut magic_buf = [0u8; 4];
    file.read_exact(&mut magic_buf)?;
    if u32::from_le_bytes(magic_buf) != HDRS_MAGIC {
        return Ok(None);
    }

    file.seek(SeekFrom::Start(VERSION_OFFSET))?;
    let mut version_buf = [0u8; 2];
    file.read_exact(&mut version_buf)?;
    let version = u16::from_le_bytes(version_buf);
    let boot_protocol_version = format!("{}.{:02}", version >> 8, version & 0xFF);

    file.seek(SeekFrom::Start(VERSION_PTR_OFFSET))?;
    let mut ptr_buf = [0u8; 2];
    file.read_exact(&mut ptr_buf)?;
    let ptr = u16::from_le_bytes(ptr_buf);

    let (full_version, short_version) = if ptr != 0 {
        let offset = 0x200u64 + ptr as u64;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; 256];
        let n = file.read(&mut buf)?;
        buf.truncate(n);
        let nul = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        let text = String::from_utf8_lossy(&buf[..nul]).into_owned();
        let short = text.split(' ').next().unwrap_or("").to_string();
        (Some(text), Some(short))
    } else {
        (None, None)
    };

    Ok(Some(InspectedKernel {
        boot_protocol_version,
        full_version,
        short_version,
    }))
}

const NON_CPIO_MAGICS: &[(&[u8], Compression)] = &[
    (&[0xFD, b'7', b'z', b'X', b'Z', 0x00], Compression::Xz),
    (&[0x28, 0xB5, 0x2F, 0xFD], Compression::Zstd),
    (&[0x02, 0x21, 0x4C, 0x18], Compression::Lz4),
    (&[0x1F, 0x8B], Compression::Gzip),
    (&[0x1F, 0x9E], Compression::GzipOld),
    (&[0x42, 0x5A], Compression::Bzip2),
    (&[0x5D, 0x00], Compression::Lzma),
];

/// Sniff the first 64 KiB of an initramfs for a known compression
/// magic, longer magics first, checked only at the start of the file.
/// A file starting with the uncompressed-cpio prefix `0707` is a
/// microcode-then-image layout candidate: scan forward through the
/// window for a non-cpio compression magic before settling on `cpio`.
fn detect_initramfs_compression(path: &Path) -> Result<Compression> {
    let mut file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut head = vec![0u8; 64 * 1024];
    let n = file.read(&mut head)?;
    head.truncate(n);

    for &(magic, kind) in NON_CPIO_MAGICS {
        if head.starts_with(magic) {
            return Ok(kind);
        }
    }

    if head.starts_with(b"0707") {
        for window_start in 1..head.len() {
            let window = &head[window_start..];
            for &(magic, kind) in NON_CPIO_MAGICS {
                if window.starts_with(magic) {
                    return Ok(kind);
                }
            }
        }
        return Ok(Compression::Cpio);
    }

    Ok(Compression::Unknown)
}

/// Extract the substring a glob's single `*` matched, given the glob
/// pattern and a filename it is known to match. Patterns here always
/// have exactly one wildcard.
fn capture_wildcard(glob_pattern: &str, file_name: &str) -> String {
    let Some(star) = glob_pattern.find('*') else {
        return String::new();
    };
    let prefix = &glob_pattern[..star];
    let suffix = &glob_pattern[star + 1..];
    if file_name.len() < prefix.len() + suffix.len() {
        return String::new();
    }
    file_name[prefix.len()..file_name.len() - suffix.len()].to_string()
}

fn load_image(path: &Path, esp_root: &Path, role: ImageRole, kernel_name: String) -> Result<BootImage> {
    let (inspected, compression) = match role {
        ImageRole::Kernel => (read_kernel_header(path)?, None),
        ImageRole::Initramfs | ImageRole::FallbackInitramfs | ImageRole::Microcode => {
            (None, Some(detect_initramfs_compression(path)?))
        }
    };
    let esp_relative_path = path
        .strip_prefix(esp_root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/");
    Ok(BootImage {
        esp_relative_path,
        role,
        kernel_name,
        inspected,
        compression,
    })
}

/// Scan `boot_dir` (paths are reported relative to `esp_root`) for
/// files matching `patterns`, first-match-wins per file.
pub fn scan(esp_root: &Path, boot_dir: &Path, patterns: &[PatternConfig]) -> Result<Vec<BootImage>> {
    let mut images = Vec::new();
    if !boot_dir.is_dir() {
        return Ok(images);
    }
    let entries: Vec<PathBuf> = std::fs::read_dir(boot_dir)
        .with_context(|| format!("reading {}", boot_dir.display()))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .collect();

    for path in entries {
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let matched = patterns
            .iter()
            .find(|p| glob::Pattern::new(&p.glob).map(|g| g.matches(file_name)).unwrap_or(false));
        let Some(pattern) = matched else { continue };
        let kernel_name = capture_wildcard(&pattern.glob, file_name);
        match load_image(&path, esp_root, pattern.role, kernel_name) {
            Ok(image) => images.push(image),
            Err(e) => log::warn!("failed to inspect {}: {e:#}", path.display()),
        }
    }
    Ok(images)
}

/// Group scanned images into one `BootSet` per non-empty `kernel_name`.
/// Microcode images (empty `kernel_name`) are collected and attached to
/// every set. Duplicate images in a singular role are logged and the
/// first one encountered wins; the name is preserved even if empty.
pub fn build_boot_sets(images: Vec<BootImage>) -> Vec<BootSet> {
    let mut microcode = Vec::new();
    let mut by_name: Vec<(String, BootSet)> = Vec::new();

    let find_or_insert = |by_name: &mut Vec<(String, BootSet)>, name: &str| -> usize {
        if let Some(idx) = by_name.iter().position(|(n, _)| n == name) {
            idx
        } else {
            by_name.push((
                name.to_string(),
                BootSet {
                    kernel_name: name.to_string(),
                    ..Default::default()
                },
            ));
            by_name.len() - 1
        }
    };

    for image in images {
        if image.role == ImageRole::Microcode {
            microcode.push(image);
            continue;
        }
        let idx = find_or_insert(&mut by_name, &image.kernel_name);
        let set = &mut by_name[idx].1;
        let slot = match image.role {
            ImageRole::Kernel => &mut set.kernel,
            ImageRole::Initramfs => &mut set.initramfs,
            ImageRole::FallbackInitramfs => &mut set.fallback_initramfs,
            ImageRole::Microcode => unreachable!(),
        };
        if slot.is_some() {
            log::warn!(
                "duplicate {:?} image for kernel {:?}: {}, keeping the first one found",
                image.role,
                image.kernel_name,
                image.esp_relative_path
            );
        } else {
            *slot = Some(image);
        }
    }

    for (_, set) in by_name.iter_mut() {
        set.microcode = microcode.clone();
        if set.kernel.is_none() {
            log::warn!("boot set {:?} has no kernel image", set.kernel_name);
        }
        if set.initramfs.is_none() {
            log::warn!("boot set {:?} has no initramfs image", set.kernel_name);
        }
    }

    by_name.sort_by(|a, b| a.0.cmp(&b.0));
    by_name.into_iter().map(|(_, set)| set).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
        let path = dir.join(name);
        let mut f = File::create(&path).unwrap();
        f.write_all(bytes).unwrap();
        path
    }

    fn kernel_bytes(version: u16, version_string: &str) -> Vec<u8> {
        let mut b = vec![0u8; 0x400];
        b[0x202..0x206].copy_from_slice(&HDRS_MAGIC.to_le_bytes());
        b[0x206..0x208].copy_from_slice(&version.to_le_bytes());
        let ptr: u16 = 0x100;
        b[0x20E..0x210].copy_from_slice(&ptr.to_le_bytes());
        let offset = 0x200 + ptr as usize;
        b[offset..offset + version_string.len()].copy_from_slice(version_string.as_bytes());
        b[offset + version_string.len()] = 0;
        b
    }

    #[test]
    fn pattern_order_prefers_fallback_before_plain() {
        let patterns = PatternConfig::defaults();
        let fallback_idx = patterns.iter().position(|p| p.role == ImageRole::FallbackInitramfs).unwrap();
        let plain_idx = patterns.iter().position(|p| p.role == ImageRole::Initramfs).unwrap();
        assert!(fallback_idx < plain_idx);
    }

    #[test]
    fn wildcard_capture_extracts_kernel_name() {
        assert_eq!(capture_wildcard("vmlinuz-*", "vmlinuz-linux-lts"), "linux-lts");
        assert_eq!(capture_wildcard("initramfs-*-fallback.img", "initramfs-linux-fallback.img"), "linux");
    }

    #[test]
    fn kernel_header_reports_full_and_short_version() {
        let td = tempfile::tempdir().unwrap();
        let path = write_file(td.path(), "vmlinuz-linux", &kernel_bytes(0x020c, "6.19.0-2-cachyos build info"));
        let inspected = read_kernel_header(&path).unwrap().unwrap();
        assert_eq!(inspected.boot_protocol_version, "2.12");
        assert_eq!(inspected.short_version.as_deref(), Some("6.19.0-2-cachyos"));
    }

    #[test]
    fn non_kernel_file_has_no_header() {
        let td = tempfile::tempdir().unwrap();
        let path = write_file(td.path(), "vmlinuz-bogus", b"not a kernel");
        assert!(read_kernel_header(&path).unwrap().is_none());
    }

    #[test]
    fn detects_zstd_and_xz_initramfs() {
        let td = tempfile::tempdir().unwrap();
        let xz = write_file(td.path(), "a", &[0xFD, b'7', b'z', b'X', b'Z', 0x00, 0, 0]);
        assert_eq!(detect_initramfs_compression(&xz).unwrap(), Compression::Xz);

        let zstd = write_file(td.path(), "b", &[0x28, 0xB5, 0x2F, 0xFD, 0, 0]);
        assert_eq!(detect_initramfs_compression(&zstd).unwrap(), Compression::Zstd);
    }

    #[test]
    fn plain_cpio_prefix_with_no_further_magic_is_cpio() {
        let td = tempfile::tempdir().unwrap();
        let mut bytes = b"070701".to_vec();
        bytes.extend_from_slice(&[0u8; 32]);
        let path = write_file(td.path(), "initramfs-linux.img", &bytes);
        assert_eq!(detect_initramfs_compression(&path).unwrap(), Compression::Cpio);
    }

    #[test]
    fn microcode_prefixed_cpio_finds_inner_compression_magic() {
        let td = tempfile::tempdir().unwrap();
        let mut bytes = b"070701".to_vec();
        bytes.extend_from_slice(&[0u8; 16]);
        bytes.extend_from_slice(&[0x28, 0xB5, 0x2F, 0xFD, 0, 0]);
        let path = write_file(td.path(), "initramfs-linux.img", &bytes);
        assert_eq!(detect_initramfs_compression(&path).unwrap(), Compression::Zstd);
    }

    #[test]
    fn non_cpio_junk_without_leading_magic_is_unknown() {
        let td = tempfile::tempdir().unwrap();
        let mut bytes = vec![0xAAu8; 16];
        bytes.extend_from_slice(b"070701");
        bytes.extend_from_slice(&[0u8; 16]);
        let path = write_file(td.path(), "early_ucode.img", &bytes);
        assert_eq!(detect_initramfs_compression(&path).unwrap(), Compression::Unknown);
    }

    #[test]
    fn scan_and_group_builds_named_sets() {
        let td = tempfile::tempdir().unwrap();
        write_file(td.path(), "vmlinuz-linux", &kernel_bytes(0x020c, "6.19.0-2 extra"));
        write_file(td.path(), "initramfs-linux.img", &[0x1F, 0x8B, 0, 0]);
        write_file(td.path(), "initramfs-linux-fallback.img", &[0x1F, 0x8B, 0, 0]);
        write_file(td.path(), "intel-ucode.img", &[0x1F, 0x8B, 0, 0]);
        write_file(td.path(), "README", b"not an image");

        let images = scan(td.path(), td.path(), &PatternConfig::defaults()).unwrap();
        let sets = build_boot_sets(images);
        assert_eq!(sets.len(), 1);
        let set = &sets[0];
        assert_eq!(set.kernel_name, "linux");
        assert!(set.kernel.is_some());
        assert!(set.initramfs.is_some());
        assert!(set.fallback_initramfs.is_some());
        assert_eq!(set.microcode.len(), 1);
        assert!(!set.is_empty());
    }

    #[test]
    fn scan_of_missing_dir_is_empty() {
        let images = scan(Path::new("/nonexistent-xyz"), Path::new("/nonexistent-xyz"), &PatternConfig::defaults()).unwrap();
        assert!(images.is_empty());
    }
}
