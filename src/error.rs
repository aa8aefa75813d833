//! Error kinds distinguished by callers, as opposed to the bulk of this
//! crate's errors which are plain `anyhow::Error` chains meant to be
//! displayed, never matched.

use thiserror::Error;

/// Errors surfaced from configuration loading that the CLI layer needs
/// to distinguish (to pick an exit code) rather than just display.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown writable snapshot method {0:?}, expected \"toggle\" or \"copy\"")]
    UnknownWritableMethod(String),
    #[error("failed to read configuration file {path:?}")]
    Read {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration file {path:?}")]
    Parse {
        path: std::path::PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Fatal, run-aborting conditions (spec §7 `FatalConfig`). These are
/// raised with `anyhow::bail!`/`Context` in most places; this type
/// exists for the couple of call sites where the CLI wants to print a
/// more specific final message.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error("root filesystem is not a copy-on-write subvolume (detected fstype {0:?})")]
    RootNotCowFs(String),
    #[error("no source boot entries matched the live root filesystem")]
    NoMatchingSourceEntries,
    #[error("refusing to generate while booted from a snapshot (use --force to override)")]
    BootedFromSnapshot,
}
