//! Environment identity and isolated process environments.
//!
//! This crate holds the pieces that decide whether two installed
//! environments are the same and how a child process gets run inside one:
//!
//! - [`fingerprint`]: order-independent content fingerprints of a tree
//! - [`search_path`]: an immutable, deduplicating executable search path
//! - [`conda`]: the variable set for running inside an environment prefix
//!
//! ```ignore
//! use rcc_env::{conda::EnvironmentAssembler, Identity, Locations};
//!
//! let locations = Locations::from_env();
//! let identity = Identity::from_env(&locations, hash);
//! let env = EnvironmentAssembler::new(locations, identity).environment_for(&prefix);
//! ```

use std::path::{Path, PathBuf};

pub mod conda;
pub mod fingerprint;
pub mod search_path;

pub use conda::{ActivationFile, ActivationSource, EnvironmentAssembler};
pub use fingerprint::{fingerprint, Fingerprint, FingerprintIndex};
pub use search_path::SearchPath;

pub const ROBOCORP_HOME: &str = "ROBOCORP_HOME";
pub const RCC_INSTALLATION_ID: &str = "RCC_INSTALLATION_ID";
pub const RCC_TRACKING_ALLOWED: &str = "RCC_TRACKING_ALLOWED";

/// Where the tool keeps its state on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Locations {
    /// Root of all tool state (`ROBOCORP_HOME`).
    pub home: PathBuf,
    /// Temp directory owned by this process, under [`Locations::temp_root`].
    pub temp: PathBuf,
}

impl Locations {
    /// Resolve the home from `ROBOCORP_HOME`, falling back to the platform
    /// default, with a fresh per-process temp directory name.
    pub fn from_env() -> Self {
        let home = std::env::var_os(ROBOCORP_HOME)
            .filter(|value| !value.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(default_home);
        Self::with_home(home)
    }

    pub fn with_home(home: impl Into<PathBuf>) -> Self {
        let home = home.into();
        let id = uuid::Uuid::new_v4().simple().to_string();
        let temp = home.join("temp").join(&id[..16]);
        Self { home, temp }
    }

    /// Parent of every process temp directory.
    pub fn temp_root(&self) -> PathBuf {
        self.home.join("temp")
    }

    pub fn bin_micromamba(&self) -> PathBuf {
        let name = if cfg!(windows) {
            "micromamba.exe"
        } else {
            "micromamba"
        };
        self.home.join("bin").join(name)
    }

    /// Persisted cache record (stamps and similar small state).
    pub fn cache_file(&self) -> PathBuf {
        self.home.join("rcccache.json")
    }

    /// A local package channel, usable when `channel/channeldata.json` is a file.
    pub fn local_channel(&self) -> Option<PathBuf> {
        let folder = self.home.join("channel");
        let metadata = std::fs::metadata(folder.join("channeldata.json")).ok()?;
        if metadata.is_dir() {
            return None;
        }
        Some(folder)
    }
}

fn default_home() -> PathBuf {
    if cfg!(windows) {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("robocorp")
    } else {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(".robocorp")
    }
}

/// Identity and tracking values exported to every environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Content hash of the environment being run.
    pub environment_hash: String,
    /// Stable identifier of this installation.
    pub installation_id: String,
    /// Whether the user allowed telemetry.
    pub tracking_allowed: bool,
}

impl Identity {
    /// Read tracking settings from the environment.
    ///
    /// Without `RCC_INSTALLATION_ID` the id is a UUIDv5 of the home path, so
    /// it stays the same for every run against the same home.
    pub fn from_env(locations: &Locations, environment_hash: impl Into<String>) -> Self {
        let installation_id = std::env::var(RCC_INSTALLATION_ID)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| installation_id_for(&locations.home));
        Self {
            environment_hash: environment_hash.into(),
            installation_id,
            tracking_allowed: tracking_allowed(),
        }
    }
}

/// User consent for telemetry, from `RCC_TRACKING_ALLOWED`. Off unless set.
pub fn tracking_allowed() -> bool {
    std::env::var(RCC_TRACKING_ALLOWED)
        .map(|value| parse_flag(&value))
        .unwrap_or(false)
}

pub fn installation_id_for(home: &Path) -> String {
    uuid::Uuid::new_v5(
        &uuid::Uuid::NAMESPACE_URL,
        home.to_string_lossy().as_bytes(),
    )
    .to_string()
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
