//! Process environments for running inside a conda/micromamba prefix.
//!
//! [`EnvironmentAssembler`] turns an environment location into the exact
//! variable list a child process needs: an isolated `PATH`, the interpreter
//! location, variables that keep Python away from host state, identity and
//! tracking variables, and finally whatever the environment's activation
//! data provides.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info};

use crate::search_path::SearchPath;
use crate::{Identity, Locations};

/// Host path entries with these base names never reach the sandbox.
pub const IGNORED_PATHS: &[&str] = &["python", "conda"];

/// Minimum encoded micromamba version accepted as usable (0.16.0).
pub const MICROMAMBA_MIN_VERSION: u64 = 16_000;

/// File written into an environment with its activation variables.
pub const ACTIVATION_FILE: &str = "rcc_activate.json";

#[cfg(windows)]
pub const FILE_EXTENSIONS: &[&str] = &[".exe", ".com", ".bat", ".cmd", ""];
#[cfg(not(windows))]
pub const FILE_EXTENSIONS: &[&str] = &[""];

/// Executable directories of an environment, highest priority first.
pub fn conda_paths(location: &Path) -> Vec<PathBuf> {
    #[cfg(windows)]
    {
        vec![
            location.to_path_buf(),
            location.join("Library").join("mingw-w64").join("bin"),
            location.join("Library").join("usr").join("bin"),
            location.join("Library").join("bin"),
            location.join("Scripts"),
            location.join("bin"),
        ]
    }
    #[cfg(not(windows))]
    {
        vec![location.join("bin")]
    }
}

/// Source of the environment-specific activation variables.
///
/// Entries are returned as `KEY=VALUE` strings and appended unmodified.
pub trait ActivationSource: Send + Sync {
    fn activation_for(&self, location: &Path) -> Vec<String>;
}

/// Reads `<location>/rcc_activate.json`, a flat JSON object of strings.
///
/// A missing or unreadable file means "no activation variables".
pub struct ActivationFile;

impl ActivationSource for ActivationFile {
    fn activation_for(&self, location: &Path) -> Vec<String> {
        let path = location.join(ACTIVATION_FILE);
        let Ok(contents) = std::fs::read_to_string(&path) else {
            return Vec::new();
        };
        match serde_json::from_str::<BTreeMap<String, String>>(&contents) {
            Ok(variables) => variables
                .into_iter()
                .map(|(key, value)| format!("{}={}", key, value))
                .collect(),
            Err(e) => {
                debug!("[conda] Ignoring malformed activation file {:?}: {}", path, e);
                Vec::new()
            }
        }
    }
}

/// Builds isolated process environments for environment locations.
///
/// The assembler holds the system search path captured at construction, so
/// building for many locations never re-reads the process `PATH`.
#[derive(Clone)]
pub struct EnvironmentAssembler {
    locations: Locations,
    identity: Identity,
    system_path: SearchPath,
    activation: Arc<dyn ActivationSource>,
}

impl EnvironmentAssembler {
    pub fn new(locations: Locations, identity: Identity) -> Self {
        Self {
            locations,
            identity,
            system_path: SearchPath::from_system_path(),
            activation: Arc::new(ActivationFile),
        }
    }

    /// Use `path` instead of the inherited `PATH` as the base search path.
    pub fn with_system_path(mut self, path: SearchPath) -> Self {
        self.system_path = path;
        self
    }

    pub fn with_activation(mut self, activation: Arc<dyn ActivationSource>) -> Self {
        self.activation = activation;
        self
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// System path without host interpreters, with the environment's own
    /// executable directories in front.
    pub fn find_path(&self, location: &Path) -> SearchPath {
        self.system_path
            .remove(IGNORED_PATHS)
            .prepend(conda_paths(location))
    }

    /// Variables to layer on top of an inherited environment.
    ///
    /// Later entries win when merged into a process environment. A missing
    /// interpreter only drops `PYTHON_EXE`; it is not an error.
    pub fn extension_for(&self, location: &Path) -> Vec<String> {
        let search_path = self.find_path(location);
        let mut environment = Vec::with_capacity(20);

        let python = search_path
            .which("python3", FILE_EXTENSIONS)
            .or_else(|| search_path.which("python", FILE_EXTENSIONS));
        match python {
            Some(python) => environment.push(format!("PYTHON_EXE={}", python.display())),
            None => debug!("[conda] No python executable found for {:?}", location),
        }

        let temp = self.locations.temp.display().to_string();
        let home = self.locations.home.display().to_string();
        environment.extend([
            "CONDA_DEFAULT_ENV=rcc".to_string(),
            format!("CONDA_PREFIX={}", location.display()),
            "CONDA_PROMPT_MODIFIER=(rcc) ".to_string(),
            "CONDA_SHLVL=1".to_string(),
            "PYTHONHOME=".to_string(),
            "PYTHONSTARTUP=".to_string(),
            "PYTHONEXECUTABLE=".to_string(),
            "PYTHONNOUSERSITE=1".to_string(),
            "PYTHONDONTWRITEBYTECODE=x".to_string(),
            format!("PYTHONPYCACHEPREFIX={}", temp),
            format!("ROBOCORP_HOME={}", home),
            format!("RCC_ENVIRONMENT_HASH={}", self.identity.environment_hash),
            format!("RCC_INSTALLATION_ID={}", self.identity.installation_id),
            format!("RCC_TRACKING_ALLOWED={}", self.identity.tracking_allowed),
            format!("TEMP={}", temp),
            format!("TMP={}", temp),
            search_path.as_environmental("PATH"),
        ]);

        environment.extend(self.activation.activation_for(location));
        environment
    }

    /// The inherited process environment followed by [`Self::extension_for`].
    pub fn environment_for(&self, location: &Path) -> Vec<String> {
        let mut environment: Vec<String> = std::env::vars_os()
            .map(|(key, value)| format!("{}={}", key.to_string_lossy(), value.to_string_lossy()))
            .collect();
        environment.extend(self.extension_for(location));
        environment
    }
}

/// Merge a `KEY=VALUE` list with last-writer-wins semantics.
///
/// Entries without `=` are skipped.
pub fn environment_map(entries: &[String]) -> HashMap<String, String> {
    entries
        .iter()
        .filter_map(|entry| entry.split_once('='))
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

/// Encode free-form version output as `major*1_000_000 + minor*1_000 + patch`.
///
/// Only the first trimmed line counts. Parsing stops at the first component
/// that is not a number, keeping whatever was encoded so far. The trimmed
/// first line is returned alongside for display.
pub fn as_version(text: &str) -> (u64, String) {
    let line = text.trim().lines().next().unwrap_or("").trim().to_string();
    let multipliers = [1_000_000u64, 1_000, 1];
    let mut version = 0u64;
    for (part, multiplier) in line.splitn(4, '.').zip(multipliers) {
        match part.parse::<u64>() {
            Ok(value) => version += multiplier * value,
            Err(_) => break,
        }
    }
    (version, line)
}

/// Run `micromamba --version` and return its version line, or the error
/// text when the binary cannot be run.
pub async fn micromamba_version(locations: &Locations) -> String {
    let binary = locations.bin_micromamba();
    let output = tokio::process::Command::new(&binary)
        .args(["--repodata-ttl", "90000", "--version"])
        .output()
        .await;
    match output {
        Ok(output) if output.status.success() => {
            as_version(&String::from_utf8_lossy(&output.stdout)).1
        }
        Ok(output) => format!(
            "{:?} exited with {}: {}",
            binary,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ),
        Err(e) => e.to_string(),
    }
}

/// True when micromamba is installed and at least 0.16.0.
pub async fn has_micromamba(locations: &Locations) -> bool {
    let binary = locations.bin_micromamba();
    if !binary.is_file() {
        return false;
    }
    let (version, text) = as_version(&micromamba_version(locations).await);
    let good_enough = version >= MICROMAMBA_MIN_VERSION;
    debug!(
        "[conda] {:?} version is {:?} -> {} (good enough: {})",
        binary, text, version, good_enough
    );
    info!("[conda] micromamba version is {:?} (at {:?})", text, binary);
    good_enough
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    struct FixedActivation(Vec<String>);

    impl ActivationSource for FixedActivation {
        fn activation_for(&self, _location: &Path) -> Vec<String> {
            self.0.clone()
        }
    }

    fn identity() -> Identity {
        Identity {
            environment_hash: "0123456789abcdef".to_string(),
            installation_id: "install-id".to_string(),
            tracking_allowed: false,
        }
    }

    fn locations(root: &Path) -> Locations {
        Locations::with_home(root.join("home"))
    }

    fn value_of<'a>(environment: &'a [String], key: &str) -> Option<&'a str> {
        let prefix = format!("{}=", key);
        environment
            .iter()
            .rev()
            .find_map(|entry| entry.strip_prefix(prefix.as_str()))
    }

    #[test]
    fn test_as_version() {
        assert_eq!(as_version("4.12.0\nextra text"), (4_012_000, "4.12.0".to_string()));
        assert_eq!(as_version("0.15.3").0, 15_003);
        assert!(as_version("0.15.3").0 < MICROMAMBA_MIN_VERSION);
        assert!(as_version("0.16.0").0 >= MICROMAMBA_MIN_VERSION);
        assert_eq!(as_version("  1.5 \n").0, 1_005_000);
        assert_eq!(as_version("2.x.7").0, 2_000_000);
        assert_eq!(as_version("1.2.3.4").0, 1_002_003);
        assert_eq!(as_version("garbage").0, 0);
        assert_eq!(as_version("").0, 0);
    }

    #[test]
    fn test_find_path_isolates_host() {
        let tmp = tempfile::tempdir().unwrap();
        let location = tmp.path().join("env");
        let assembler = EnvironmentAssembler::new(locations(tmp.path()), identity())
            .with_system_path(SearchPath::new(["/usr/bin", "/opt/conda", "/home/u/python", "/bin"]));

        let path = assembler.find_path(&location);
        let entries = path.entries();
        assert_eq!(entries[0], conda_paths(&location)[0]);
        assert!(!path.contains(Path::new("/opt/conda")));
        assert!(!path.contains(Path::new("/home/u/python")));
        assert!(path.contains(Path::new("/usr/bin")));
        assert!(path.contains(Path::new("/bin")));
    }

    #[test]
    fn test_extension_contents() {
        let tmp = tempfile::tempdir().unwrap();
        let location = tmp.path().join("env");
        let bin = conda_paths(&location).pop().unwrap();
        fs::create_dir_all(&bin).unwrap();
        let python = bin.join(format!("python3{}", FILE_EXTENSIONS[0]));
        fs::write(&python, "").unwrap();

        let locs = locations(tmp.path());
        let assembler = EnvironmentAssembler::new(locs.clone(), identity())
            .with_system_path(SearchPath::new(["/usr/bin"]))
            .with_activation(Arc::new(FixedActivation(vec!["EXTRA=1".to_string()])));
        let environment = assembler.extension_for(&location);

        let temp = locs.temp.display().to_string();
        assert_eq!(value_of(&environment, "PYTHON_EXE"), Some(python.display().to_string().as_str()));
        assert_eq!(value_of(&environment, "CONDA_PREFIX"), Some(location.display().to_string().as_str()));
        assert_eq!(value_of(&environment, "CONDA_DEFAULT_ENV"), Some("rcc"));
        assert_eq!(value_of(&environment, "PYTHONHOME"), Some(""));
        assert_eq!(value_of(&environment, "PYTHONNOUSERSITE"), Some("1"));
        assert_eq!(value_of(&environment, "PYTHONPYCACHEPREFIX"), Some(temp.as_str()));
        assert_eq!(value_of(&environment, "TEMP"), Some(temp.as_str()));
        assert_eq!(value_of(&environment, "TMP"), Some(temp.as_str()));
        assert_eq!(value_of(&environment, "RCC_ENVIRONMENT_HASH"), Some("0123456789abcdef"));
        assert_eq!(value_of(&environment, "RCC_INSTALLATION_ID"), Some("install-id"));
        assert_eq!(value_of(&environment, "RCC_TRACKING_ALLOWED"), Some("false"));
        assert_eq!(
            value_of(&environment, "ROBOCORP_HOME"),
            Some(locs.home.display().to_string().as_str())
        );
        assert!(value_of(&environment, "PATH").unwrap().starts_with(&conda_paths(&location)[0].display().to_string()));

        // Activation variables come last, after PATH.
        assert_eq!(environment.last().map(String::as_str), Some("EXTRA=1"));
        assert!(environment[environment.len() - 2].starts_with("PATH="));
    }

    #[test]
    fn test_python_fallback_name() {
        let tmp = tempfile::tempdir().unwrap();
        let location = tmp.path().join("env");
        let bin = conda_paths(&location).pop().unwrap();
        fs::create_dir_all(&bin).unwrap();
        let python = bin.join(format!("python{}", FILE_EXTENSIONS[0]));
        fs::write(&python, "").unwrap();

        let assembler = EnvironmentAssembler::new(locations(tmp.path()), identity())
            .with_system_path(SearchPath::default());
        let environment = assembler.extension_for(&location);
        assert_eq!(value_of(&environment, "PYTHON_EXE"), Some(python.display().to_string().as_str()));
    }

    #[test]
    fn test_missing_python_is_tolerated() {
        let tmp = tempfile::tempdir().unwrap();
        let assembler = EnvironmentAssembler::new(locations(tmp.path()), identity())
            .with_system_path(SearchPath::default());
        let environment = assembler.extension_for(&tmp.path().join("empty"));
        assert_eq!(value_of(&environment, "PYTHON_EXE"), None);
        assert!(value_of(&environment, "PATH").is_some());
    }

    #[test]
    fn test_environment_for_extends_inherited() {
        let tmp = tempfile::tempdir().unwrap();
        let assembler = EnvironmentAssembler::new(locations(tmp.path()), identity())
            .with_system_path(SearchPath::default());
        let location = tmp.path().join("env");

        let full = assembler.environment_for(&location);
        let extension = assembler.extension_for(&location);
        assert!(full.len() >= extension.len());
        assert_eq!(&full[full.len() - extension.len()..], extension.as_slice());

        let merged = environment_map(&full);
        assert_eq!(merged.get("CONDA_SHLVL").map(String::as_str), Some("1"));
        assert_eq!(merged.get("PYTHONSTARTUP").map(String::as_str), Some(""));
    }

    #[test]
    fn test_activation_file() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(
            tmp.path().join(ACTIVATION_FILE),
            r#"{"ZETA": "last", "ALPHA": "a=b"}"#,
        )
        .unwrap();
        assert_eq!(
            ActivationFile.activation_for(tmp.path()),
            vec!["ALPHA=a=b".to_string(), "ZETA=last".to_string()]
        );

        fs::write(tmp.path().join(ACTIVATION_FILE), "not json").unwrap();
        assert!(ActivationFile.activation_for(tmp.path()).is_empty());
        assert!(ActivationFile.activation_for(&tmp.path().join("missing")).is_empty());
    }

    #[test]
    fn test_environment_map_last_wins() {
        let entries = vec![
            "A=1".to_string(),
            "B=x=y".to_string(),
            "junk".to_string(),
            "A=2".to_string(),
        ];
        let merged = environment_map(&entries);
        assert_eq!(merged["A"], "2");
        assert_eq!(merged["B"], "x=y");
        assert_eq!(merged.len(), 2);
    }

    #[tokio::test]
    async fn test_has_micromamba_without_binary() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(!has_micromamba(&locations(tmp.path())).await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_micromamba_version_from_script() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let locs = locations(tmp.path());
        let binary = locs.bin_micromamba();
        fs::create_dir_all(binary.parent().unwrap()).unwrap();
        fs::write(&binary, "#!/bin/sh\necho 0.15.3\necho noise\n").unwrap();
        fs::set_permissions(&binary, fs::Permissions::from_mode(0o755)).unwrap();

        assert_eq!(micromamba_version(&locs).await, "0.15.3");
        assert!(!has_micromamba(&locs).await);

        fs::write(&binary, "#!/bin/sh\necho 1.4.2\n").unwrap();
        assert!(has_micromamba(&locs).await);
    }
}
