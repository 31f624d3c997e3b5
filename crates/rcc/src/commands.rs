//! Subcommand implementations, kept out of `main` so they can be tested.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{debug, info};
use rcc_env::conda::{environment_map, has_micromamba, micromamba_version, FILE_EXTENSIONS};
use rcc_env::fingerprint::short_fingerprint;
use rcc_env::{fingerprint, EnvironmentAssembler, FingerprintIndex, Identity, Locations};

use crate::lifecycle::{ControlledExit, LifecycleContext};
use crate::stamps::timezone_metric;

/// Exit code when the requested program cannot be found.
pub const NOT_FOUND: i32 = 127;

/// Digest of `dir` as hex, optionally followed by one `digest  path` line
/// per directory, sorted by path.
pub fn fingerprint_report(dir: &Path, index: bool) -> Result<Vec<String>> {
    let mut collected = FingerprintIndex::new();
    let digest = fingerprint(dir, index.then_some(&mut collected))
        .with_context(|| format!("Failed to fingerprint {:?}", dir))?;

    let mut lines = vec![hex::encode(digest)];
    let mut entries: Vec<_> = collected.into_iter().collect();
    entries.sort();
    lines.extend(
        entries
            .into_iter()
            .map(|(path, digest)| format!("{}  {}", digest, path.display())),
    );
    Ok(lines)
}

/// Assembler for the environment at `location`.
///
/// Without an explicit `hash`, the environment is identified by a short
/// fingerprint of `location` itself.
pub fn assembler_for(
    locations: &Locations,
    location: &Path,
    hash: Option<String>,
) -> Result<EnvironmentAssembler> {
    if !location.is_dir() {
        return Err(ControlledExit::new(
            2,
            format!("Environment location {:?} is not a directory.", location),
        )
        .into());
    }
    let hash = match hash {
        Some(hash) => hash,
        None => short_fingerprint(location)?,
    };
    debug!("[run] Environment {:?} has hash {}", location, hash);
    let identity = Identity::from_env(locations, hash);
    Ok(EnvironmentAssembler::new(locations.clone(), identity))
}

/// Variables for `location`: only the extension, or the full merged set.
pub fn environment_report(assembler: &EnvironmentAssembler, location: &Path, full: bool) -> Vec<String> {
    if full {
        let mut variables: Vec<_> = environment_map(&assembler.environment_for(location))
            .into_iter()
            .collect();
        variables.sort();
        variables
            .into_iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect()
    } else {
        assembler.extension_for(location)
    }
}

/// Resolve `program` the way the child would: as given when it contains a
/// path separator, otherwise through the environment's search path.
pub fn resolve_program(assembler: &EnvironmentAssembler, location: &Path, program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return Some(candidate.to_path_buf());
    }
    assembler.find_path(location).which(program, FILE_EXTENSIONS)
}

/// Run `command` inside the environment at `location`.
///
/// The child sees exactly the assembled environment and inherits the
/// caller's working directory. A non-zero exit is a [`ControlledExit`]
/// carrying the child's code.
pub async fn run_in_environment(
    assembler: &EnvironmentAssembler,
    location: &Path,
    command: &[String],
) -> Result<()> {
    let Some((program, args)) = command.split_first() else {
        return Err(ControlledExit::new(2, "Nothing to run.").into());
    };
    let Some(executable) = resolve_program(assembler, location, program) else {
        return Err(ControlledExit::new(
            NOT_FOUND,
            format!("Could not find {:?} in environment {:?}.", program, location),
        )
        .into());
    };

    let variables = environment_map(&assembler.environment_for(location));
    info!("[run] Running {:?} {:?}", executable, args);
    let status = tokio::process::Command::new(&executable)
        .args(args)
        .env_clear()
        .envs(&variables)
        .status()
        .await
        .with_context(|| format!("Failed to start {:?}", executable))?;

    if status.success() {
        return Ok(());
    }
    let code = status.code().unwrap_or(1);
    Err(ControlledExit::new(code, format!("{} exited with {}.", program, status)).into())
}

/// Close out a command: record the milestone and, only after a successful
/// command, send the daily timezone metric. The command's result is passed
/// through untouched.
pub fn after_command(ctx: &LifecycleContext, result: Result<()>) -> Result<()> {
    ctx.timeline().record("Command execution done.");
    if result.is_ok() {
        if let Err(e) = timezone_metric(ctx) {
            debug!("[stamps] Timezone metric skipped: {:?}", e);
        }
    }
    result
}

/// Installed micromamba version and whether it is usable.
pub async fn micromamba_report(locations: &Locations) -> Vec<String> {
    let mut lines = vec![
        format!("micromamba: {:?}", locations.bin_micromamba()),
        format!("version: {}", micromamba_version(locations).await),
        format!("usable: {}", has_micromamba(locations).await),
    ];
    if let Some(channel) = locations.local_channel() {
        lines.push(format!("local channel: {:?}", channel));
    }
    lines
}
