use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::ErrorCode;

/// Top-level configuration file (`weave.toml`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeaveConfig {
    #[serde(default)]
    pub tree: TreeConfig,
    #[serde(default)]
    pub precalc: PrecalcConfig,
}

/// When superseded atoms may be physically removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GcPolicy {
    /// Never collect.
    Disabled,
    /// Collect immediately; only safe when no other replica can still
    /// reference the collected atoms (single process, tests).
    Eager,
    /// Collect only atoms every known peer has acknowledged.
    #[default]
    Acknowledged,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeConfig {
    #[serde(default)]
    pub gc: GcPolicy,
    #[serde(default = "default_true")]
    pub verify_checksums: bool,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            gc: GcPolicy::default(),
            verify_checksums: default_true(),
        }
    }
}

impl TreeConfig {
    /// Shorthand used by tests and single-process tools.
    #[must_use]
    pub fn eager() -> Self {
        Self {
            gc: GcPolicy::Eager,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrecalcConfig {
    /// Nesting limit for formulas that read other formulas.
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
}

impl Default for PrecalcConfig {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
        }
    }
}

/// Load configuration from a TOML file. A missing file yields defaults.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_config(path: &Path) -> Result<WeaveConfig> {
    if !path.exists() {
        return Ok(WeaveConfig::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    parse_config(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

/// Parse configuration from TOML text.
///
/// # Errors
///
/// Returns an error on invalid TOML or unknown enum values.
pub fn parse_config(text: &str) -> Result<WeaveConfig> {
    let code = ErrorCode::ConfigParseError;
    toml::from_str::<WeaveConfig>(text).with_context(|| format!("{code}: {}", code.message()))
}

const fn default_true() -> bool {
    true
}

const fn default_max_depth() -> usize {
    32
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_text_yields_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config, WeaveConfig::default());
        assert_eq!(config.tree.gc, GcPolicy::Acknowledged);
        assert!(config.tree.verify_checksums);
        assert_eq!(config.precalc.max_depth, 32);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = parse_config("[tree]\ngc = \"eager\"\n").unwrap();
        assert_eq!(config.tree.gc, GcPolicy::Eager);
        assert!(config.tree.verify_checksums);
        assert_eq!(config.precalc, PrecalcConfig::default());
    }

    #[test]
    fn unknown_policy_is_rejected() {
        let err = parse_config("[tree]\ngc = \"sometimes\"\n").unwrap_err();
        assert!(format!("{err:#}").starts_with("E1001"), "{err:#}");
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("weave.toml")).unwrap();
        assert_eq!(config, WeaveConfig::default());
    }

    #[test]
    fn loads_file_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weave.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "[tree]\ngc = \"disabled\"\nverify_checksums = false\n").unwrap();
        writeln!(file, "[precalc]\nmax_depth = 4").unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.tree.gc, GcPolicy::Disabled);
        assert!(!config.tree.verify_checksums);
        assert_eq!(config.precalc.max_depth, 4);
    }

    #[test]
    fn malformed_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weave.toml");
        std::fs::write(&path, "[tree\n").unwrap();
        let err = load_config(&path).unwrap_err();
        let text = format!("{err:#}");
        assert!(text.contains("weave.toml"), "{text}");
        assert!(text.contains(ErrorCode::ConfigParseError.code()), "{text}");
    }
}
