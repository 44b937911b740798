//! Locating and parsing the RON configuration file.

use std::path::{Path, PathBuf};

use anyhow::Context;
use ron::extensions::Extensions;

use crate::controller::Trickle;

/// Environment variable naming the configuration file
pub const CONFIG_ENV: &str = "TRICKLE_CONFIG";

/// Parse a configuration document
///
/// `implicit_some` and `unwrap_variant_newtypes` are enabled, so optional
/// values and enum payloads can be written bare:
///
/// ```ron
/// Trickle (
///     store: Sqlite(path: "/var/lib/trickle/trickle.db"),
///     transport: Smtp(host: "smtp.example.com", from: "letters@example.com"),
/// )
/// ```
///
/// # Errors
///
/// If the document is not valid RON for [`Trickle`].
pub fn parse(input: &str) -> Result<Trickle, ron::error::SpannedError> {
    ron::Options::default()
        .with_default_extension(Extensions::IMPLICIT_SOME)
        .with_default_extension(Extensions::UNWRAP_VARIANT_NEWTYPES)
        .from_str(input)
}

/// Read and parse the configuration at `path`
///
/// # Errors
///
/// If the file cannot be read or parsed.
pub fn load(path: &Path) -> anyhow::Result<Trickle> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config from {}", path.display()))?;

    parse(&content).with_context(|| format!("Failed to parse config from {}", path.display()))
}

/// Find the configuration file using the following precedence:
/// 1. `TRICKLE_CONFIG` environment variable
/// 2. ./trickle.config.ron (current working directory)
/// 3. /etc/trickle/trickle.config.ron (system-wide config)
///
/// # Errors
///
/// If `TRICKLE_CONFIG` names a missing file, or none of the defaults exist.
pub fn find_config_file() -> anyhow::Result<PathBuf> {
    let defaults = [
        PathBuf::from("./trickle.config.ron"),
        PathBuf::from("/etc/trickle/trickle.config.ron"),
    ];

    locate(std::env::var_os(CONFIG_ENV).map(PathBuf::from), &defaults)
}

fn locate(env_path: Option<PathBuf>, defaults: &[PathBuf]) -> anyhow::Result<PathBuf> {
    if let Some(path) = env_path {
        if path.exists() {
            return Ok(path);
        }
        anyhow::bail!(
            "{CONFIG_ENV} points to non-existent file: {}",
            path.display()
        );
    }

    if let Some(path) = defaults.iter().find(|path| path.exists()) {
        return Ok(path.clone());
    }

    let paths_tried = defaults
        .iter()
        .map(|p| format!("  - {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n");

    anyhow::bail!(
        "No configuration file found. Tried:\n  - {CONFIG_ENV} environment variable\n{paths_tried}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_path_wins() {
        let dir = tempfile::tempdir().expect("tempdir");
        let env = dir.path().join("env.ron");
        let fallback = dir.path().join("fallback.ron");
        std::fs::write(&env, "()").expect("write");
        std::fs::write(&fallback, "()").expect("write");

        let found = locate(Some(env.clone()), &[fallback]).expect("locate");
        assert_eq!(found, env);
    }

    #[test]
    fn test_missing_env_path_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fallback = dir.path().join("fallback.ron");
        std::fs::write(&fallback, "()").expect("write");

        let err = locate(Some(dir.path().join("missing.ron")), &[fallback])
            .expect_err("missing file");
        assert!(err.to_string().contains("non-existent"));
    }

    #[test]
    fn test_first_existing_default() {
        let dir = tempfile::tempdir().expect("tempdir");
        let first = dir.path().join("first.ron");
        let second = dir.path().join("second.ron");
        std::fs::write(&second, "()").expect("write");

        let found = locate(None, &[first.clone(), second.clone()]).expect("locate");
        assert_eq!(found, second);

        let err = locate(None, &[first]).expect_err("nothing exists");
        assert!(err.to_string().contains("No configuration file found"));
    }

    #[test]
    fn test_load_reports_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("broken.ron");
        std::fs::write(&path, "(store: ").expect("write");

        let err = load(&path).expect_err("broken config");
        assert!(format!("{err:#}").contains("broken.ron"));
    }
}
