use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Format, Serialized, Toml};
use figment::value::{Dict, Value};
use figment::{Figment, Profile, Provider};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::paths::{get_config_file_path, get_data_dir};
use crate::sample::MAX_SIDE;

/// What the module answers when it cannot reach a verdict.
///
/// No variant grants access.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureAction {
    Deny,
    Ignore,
    CredUnavail,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Matching {
    pub threshold: f64,
    pub min_matched_points: usize,
    pub distance_tolerance: f64,
    pub angle_tolerance_deg: f64,
    pub max_points: usize,
    pub max_hypotheses: usize,
}

impl Default for Matching {
    fn default() -> Self {
        Self {
            threshold: 0.6,
            min_matched_points: 12,
            distance_tolerance: 12.0,
            angle_tolerance_deg: 20.0,
            max_points: 128,
            max_hypotheses: 8,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Extraction {
    pub min_quality: f64,
    pub block_size: usize,
    pub min_block_variance: f64,
    pub max_points: usize,
}

impl Default for Extraction {
    fn default() -> Self {
        Self {
            min_quality: 0.25,
            block_size: 16,
            min_block_variance: 100.0,
            max_points: 128,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Store {
    pub template_path: PathBuf,
    pub max_templates_per_identity: usize,
}

impl Default for Store {
    fn default() -> Self {
        Self {
            template_path: get_data_dir(),
            max_templates_per_identity: 10,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Policy {
    pub timeout_ms: u64,
    pub max_attempts: u32,
    pub not_enrolled: FailureAction,
    pub on_error: FailureAction,
    pub on_sensor_unavailable: FailureAction,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            max_attempts: 3,
            not_enrolled: FailureAction::Ignore,
            on_error: FailureAction::Deny,
            on_sensor_unavailable: FailureAction::Deny,
        }
    }
}

impl Policy {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Capture {
    pub path: PathBuf,
    pub dpi: u32,
    /// Frames wider or taller than this are refused before decoding.
    pub max_width: u32,
    pub max_height: u32,
    /// Uid that must own spool frames.
    pub owner_uid: u32,
}

impl Default for Capture {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/run/pam-fingerprint/capture.pgm"),
            dpi: 500,
            max_width: 1024,
            max_height: 1024,
            owner_uid: 0,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub matching: Matching,
    pub extraction: Extraction,
    pub store: Store,
    pub policy: Policy,
    pub capture: Capture,
}

/// Flat module argument names and the configuration keys they set.
const MODULE_ARGS: &[(&str, &str)] = &[
    ("threshold", "matching.threshold"),
    ("min_matched_points", "matching.min_matched_points"),
    ("min_quality", "extraction.min_quality"),
    ("minQuality", "extraction.min_quality"),
    ("timeout_ms", "policy.timeout_ms"),
    ("timeoutMs", "policy.timeout_ms"),
    ("max_attempts", "policy.max_attempts"),
    ("not_enrolled", "policy.not_enrolled"),
    ("on_error", "policy.on_error"),
    ("on_sensor_unavailable", "policy.on_sensor_unavailable"),
    ("template_path", "store.template_path"),
    ("templatePath", "store.template_path"),
    ("max_templates_per_identity", "store.max_templates_per_identity"),
    ("maxTemplatesPerIdentity", "store.max_templates_per_identity"),
    ("capture_path", "capture.path"),
    ("capture_dpi", "capture.dpi"),
    ("capture_max_width", "capture.max_width"),
    ("capture_max_height", "capture.max_height"),
    ("capture_owner_uid", "capture.owner_uid"),
];

const KNOWN_KEYS: &[&str] = &[
    "matching.threshold",
    "matching.min_matched_points",
    "matching.distance_tolerance",
    "matching.angle_tolerance_deg",
    "matching.max_points",
    "matching.max_hypotheses",
    "extraction.min_quality",
    "extraction.block_size",
    "extraction.min_block_variance",
    "extraction.max_points",
    "store.template_path",
    "store.max_templates_per_identity",
    "policy.timeout_ms",
    "policy.max_attempts",
    "policy.not_enrolled",
    "policy.on_error",
    "policy.on_sensor_unavailable",
    "capture.path",
    "capture.dpi",
    "capture.max_width",
    "capture.max_height",
    "capture.owner_uid",
];

/// Result of loading the configuration: the effective values and every
/// problem that was papered over on the way.
#[derive(Debug, Clone)]
pub struct Loaded {
    pub config: Config,
    pub warnings: Vec<String>,
}

impl Config {
    /// Loads `file` (if present) and applies PAM module arguments on top.
    ///
    /// Never fails: unknown keys are reported, unparseable input falls back
    /// to defaults and out-of-range values are reset to their defaults.
    /// A `config=<path>` argument replaces `file`.
    pub fn load(file: &Path, args: &[String]) -> Loaded {
        let mut warnings = Vec::new();
        let mut file = file.to_path_buf();
        let mut overrides = Vec::new();

        for arg in args {
            let Some((key, value)) = arg.split_once('=') else {
                warnings.push(format!("ignoring unknown module option `{arg}`"));
                continue;
            };

            if key == "config" {
                file = PathBuf::from(value);
                continue;
            }

            match MODULE_ARGS.iter().find(|(name, _)| *name == key) {
                Some((_, path)) => overrides.push((*path, value)),
                None => warnings.push(format!("ignoring unknown module option `{key}`")),
            }
        }

        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if file.exists() {
            figment = figment.merge(Toml::file(&file));
        }
        for (path, value) in overrides {
            let value: Value = value.parse().unwrap_or_else(|never| match never {});
            figment = figment.merge(Serialized::default(path, value));
        }

        if let Ok(data) = figment.data() {
            if let Some(dict) = data.get(&Profile::Default) {
                let mut keys = Vec::new();
                flatten_keys("", dict, &mut keys);
                for key in keys {
                    if !KNOWN_KEYS.contains(&key.as_str()) {
                        warnings.push(format!("ignoring unknown configuration key `{key}`"));
                    }
                }
            }
        }

        let config = match figment.extract::<Config>() {
            Ok(config) => config.validated(&mut warnings),
            Err(err) => {
                warnings.push(format!("invalid configuration, using defaults: {err}"));
                Config::default()
            }
        };

        for warning in &warnings {
            warn!("{warning}");
        }

        Loaded { config, warnings }
    }

    /// Loads the system-wide configuration file.
    pub fn load_system(args: &[String]) -> Loaded {
        Self::load(&get_config_file_path(), args)
    }

    fn validated(mut self, warnings: &mut Vec<String>) -> Self {
        let defaults = Config::default();

        macro_rules! reset_unless {
            ($ok:expr, $field:expr, $default:expr, $name:literal) => {
                if !$ok {
                    warnings.push(format!(
                        "{} = {:?} is out of range, using {:?}",
                        $name, $field, $default
                    ));
                    $field = $default;
                }
            };
        }

        let m = &mut self.matching;
        reset_unless!(
            m.threshold.is_finite() && (0.0..=1.0).contains(&m.threshold),
            m.threshold,
            defaults.matching.threshold,
            "matching.threshold"
        );
        reset_unless!(
            m.distance_tolerance.is_finite() && m.distance_tolerance > 0.0,
            m.distance_tolerance,
            defaults.matching.distance_tolerance,
            "matching.distance_tolerance"
        );
        reset_unless!(
            m.angle_tolerance_deg.is_finite() && (0.0..90.0).contains(&m.angle_tolerance_deg),
            m.angle_tolerance_deg,
            defaults.matching.angle_tolerance_deg,
            "matching.angle_tolerance_deg"
        );
        reset_unless!(
            (1..=512).contains(&m.max_points),
            m.max_points,
            defaults.matching.max_points,
            "matching.max_points"
        );
        reset_unless!(
            (1..=64).contains(&m.max_hypotheses),
            m.max_hypotheses,
            defaults.matching.max_hypotheses,
            "matching.max_hypotheses"
        );

        let e = &mut self.extraction;
        reset_unless!(
            e.min_quality.is_finite() && (0.0..=1.0).contains(&e.min_quality),
            e.min_quality,
            defaults.extraction.min_quality,
            "extraction.min_quality"
        );
        reset_unless!(
            (8..=32).contains(&e.block_size),
            e.block_size,
            defaults.extraction.block_size,
            "extraction.block_size"
        );
        reset_unless!(
            e.min_block_variance.is_finite() && e.min_block_variance > 0.0,
            e.min_block_variance,
            defaults.extraction.min_block_variance,
            "extraction.min_block_variance"
        );
        reset_unless!(
            (1..=512).contains(&e.max_points),
            e.max_points,
            defaults.extraction.max_points,
            "extraction.max_points"
        );

        let s = &mut self.store;
        reset_unless!(
            s.max_templates_per_identity >= 1,
            s.max_templates_per_identity,
            defaults.store.max_templates_per_identity,
            "store.max_templates_per_identity"
        );

        let p = &mut self.policy;
        reset_unless!(
            p.timeout_ms > 0,
            p.timeout_ms,
            defaults.policy.timeout_ms,
            "policy.timeout_ms"
        );
        reset_unless!(
            (1..=10).contains(&p.max_attempts),
            p.max_attempts,
            defaults.policy.max_attempts,
            "policy.max_attempts"
        );

        let c = &mut self.capture;
        reset_unless!(
            (100..=2000).contains(&c.dpi),
            c.dpi,
            defaults.capture.dpi,
            "capture.dpi"
        );
        reset_unless!(
            (48..=MAX_SIDE).contains(&c.max_width),
            c.max_width,
            defaults.capture.max_width,
            "capture.max_width"
        );
        reset_unless!(
            (48..=MAX_SIDE).contains(&c.max_height),
            c.max_height,
            defaults.capture.max_height,
            "capture.max_height"
        );

        self
    }
}

fn flatten_keys(prefix: &str, dict: &Dict, out: &mut Vec<String>) {
    for (key, value) in dict {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        match value {
            Value::Dict(_, nested) => flatten_keys(&path, nested, out),
            _ => out.push(path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = Config::load(&dir.path().join("absent.toml"), &[]);
        assert_eq!(loaded.config, Config::default());
        assert!(loaded.warnings.is_empty());
    }

    #[test]
    fn module_args_override_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("config.toml");
        fs::write(&file, "[matching]\nthreshold = 0.7\n[policy]\ntimeout_ms = 500\n").unwrap();

        let loaded = Config::load(
            &file,
            &args(&["threshold=0.9", "maxTemplatesPerIdentity=4", "on_error=ignore"]),
        );
        assert_eq!(loaded.config.matching.threshold, 0.9);
        assert_eq!(loaded.config.policy.timeout_ms, 500);
        assert_eq!(loaded.config.store.max_templates_per_identity, 4);
        assert_eq!(loaded.config.policy.on_error, FailureAction::Ignore);
        assert!(loaded.warnings.is_empty());
    }

    #[test]
    fn unknown_options_warn_but_load() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("config.toml");
        fs::write(&file, "[matching]\nthreshold = 0.75\nfuzz = 3\n").unwrap();

        let loaded = Config::load(&file, &args(&["debug", "colour=blue"]));
        assert_eq!(loaded.config.matching.threshold, 0.75);
        assert_eq!(loaded.warnings.len(), 3);
        assert!(loaded.warnings.iter().any(|w| w.contains("matching.fuzz")));
        assert!(loaded.warnings.iter().any(|w| w.contains("colour")));
    }

    #[test]
    fn out_of_range_values_reset() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = Config::load(
            &dir.path().join("absent.toml"),
            &args(&["threshold=1.5", "timeout_ms=0"]),
        );
        assert_eq!(loaded.config.matching.threshold, Matching::default().threshold);
        assert_eq!(loaded.config.policy.timeout_ms, Policy::default().timeout_ms);
        assert_eq!(loaded.warnings.len(), 2);
    }

    #[test]
    fn garbage_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("config.toml");
        fs::write(&file, "[matching]\nthreshold = \"high\"\n").unwrap();

        let loaded = Config::load(&file, &[]);
        assert_eq!(loaded.config, Config::default());
        assert!(!loaded.warnings.is_empty());
    }

    #[test]
    fn config_arg_switches_file() {
        let dir = tempfile::tempdir().unwrap();
        let other = dir.path().join("other.toml");
        fs::write(&other, "[policy]\nmax_attempts = 1\n").unwrap();

        let loaded = Config::load(
            &dir.path().join("absent.toml"),
            &args(&[&format!("config={}", other.display())]),
        );
        assert_eq!(loaded.config.policy.max_attempts, 1);
    }

    #[test]
    fn numeric_module_args_keep_their_type() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = Config::load(
            &dir.path().join("absent.toml"),
            &args(&["min_matched_points=7", "capture_max_width=640", "minQuality=0.4"]),
        );
        assert_eq!(loaded.config.matching.min_matched_points, 7);
        assert_eq!(loaded.config.capture.max_width, 640);
        assert_eq!(loaded.config.extraction.min_quality, 0.4);
        assert!(loaded.warnings.is_empty(), "{:?}", loaded.warnings);
    }

    #[test]
    fn oversized_capture_limits_reset() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = Config::load(
            &dir.path().join("absent.toml"),
            &args(&["capture_max_width=100000", "capture_max_height=0"]),
        );
        assert_eq!(loaded.config.capture.max_width, Capture::default().max_width);
        assert_eq!(loaded.config.capture.max_height, Capture::default().max_height);
        assert_eq!(loaded.warnings.len(), 2);
    }

    #[test]
    fn default_serializes_to_toml() {
        let text = toml::to_string_pretty(&Config::default()).unwrap();
        assert!(text.contains("[matching]"));
        assert!(text.contains("not_enrolled = \"ignore\""));
    }
}
