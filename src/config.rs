use crate::features::{validate_horizons, NullDropPolicy, DEFAULT_HORIZONS};
use crate::model::{ForestConfig, Parallelism};
use crate::selection::{REFERENCE_LOWER_BOUND, REFERENCE_UPPER_BOUND};
use crate::split::DEFAULT_TAIL_SIZE;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

pub const ENV_PREFIX: &str = "STOCKML_";

/// Everything one analysis run needs besides the price data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisSettings {
    pub horizons: Vec<usize>,
    pub null_drop: NullDropPolicy,
    pub selection_lower_bound: f64,
    pub selection_upper_bound: f64,
    pub tail_size: usize,
    pub forest: ForestConfig,
    pub delimiter: u8,
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            horizons: DEFAULT_HORIZONS.to_vec(),
            null_drop: NullDropPolicy::default(),
            selection_lower_bound: REFERENCE_LOWER_BOUND,
            selection_upper_bound: REFERENCE_UPPER_BOUND,
            tail_size: DEFAULT_TAIL_SIZE,
            forest: ForestConfig::default(),
            delimiter: b',',
        }
    }
}

impl AnalysisSettings {
    /// Missing keys keep their defaults; present keys must be valid.
    pub fn from_settings_map(settings: &HashMap<String, String>) -> Result<Self> {
        let defaults = Self::default();
        let forest_defaults = &defaults.forest;

        let horizons = match lookup_setting(settings, "HORIZONS") {
            Some(_) => setting_usize_list(settings, "HORIZONS")?,
            None => defaults.horizons.clone(),
        };
        validate_horizons(&horizons).map_err(|err| anyhow!("Setting HORIZONS: {}", err))?;

        let null_drop = match lookup_setting(settings, "NULL_DROP_POLICY") {
            Some(raw) => raw
                .parse::<NullDropPolicy>()
                .map_err(|err| anyhow!("Setting NULL_DROP_POLICY: {}", err))?,
            None => defaults.null_drop,
        };

        let selection_lower_bound = setting_f64(
            settings,
            "SELECTION_LOWER_BOUND",
            defaults.selection_lower_bound,
            Some(0.0),
            None,
        )?;
        let selection_upper_bound = setting_f64(
            settings,
            "SELECTION_UPPER_BOUND",
            defaults.selection_upper_bound,
            Some(0.0),
            None,
        )?;
        if selection_upper_bound < selection_lower_bound {
            return Err(anyhow!(
                "SELECTION_UPPER_BOUND ({}) must be >= SELECTION_LOWER_BOUND ({})",
                selection_upper_bound,
                selection_lower_bound
            ));
        }

        let tail_size = setting_usize(settings, "TAIL_SIZE", defaults.tail_size, 1)?;

        let threads = setting_usize(settings, "FOREST_THREADS", 0, 0)?;
        let forest = ForestConfig {
            tree_count: setting_usize(
                settings,
                "FOREST_TREE_COUNT",
                forest_defaults.tree_count,
                1,
            )?,
            max_depth: setting_usize(settings, "FOREST_MAX_DEPTH", forest_defaults.max_depth, 1)?,
            min_samples_split: setting_usize(
                settings,
                "FOREST_MIN_SAMPLES_SPLIT",
                forest_defaults.min_samples_split,
                2,
            )?,
            min_samples_leaf: setting_usize(
                settings,
                "FOREST_MIN_SAMPLES_LEAF",
                forest_defaults.min_samples_leaf,
                1,
            )?,
            max_features: forest_defaults.max_features,
            bootstrap: setting_bool(settings, "FOREST_BOOTSTRAP", forest_defaults.bootstrap)?,
            parallelism: if threads == 0 {
                Parallelism::AllCores
            } else {
                Parallelism::Threads(threads)
            },
            random_seed: setting_usize(
                settings,
                "FOREST_RANDOM_SEED",
                forest_defaults.random_seed as usize,
                0,
            )? as u64,
        };

        let delimiter = match lookup_setting(settings, "CSV_DELIMITER") {
            Some(raw) => parse_delimiter(raw)?,
            None => defaults.delimiter,
        };

        Ok(Self {
            horizons,
            null_drop,
            selection_lower_bound,
            selection_upper_bound,
            tail_size,
            forest,
            delimiter,
        })
    }

    /// Settings file (if any) overlaid with `STOCKML_*` environment variables.
    pub fn load(settings_path: Option<&Path>) -> Result<Self> {
        let mut settings = match settings_path {
            Some(path) => read_settings_file(path)?,
            None => HashMap::new(),
        };
        settings.extend(settings_from_env(std::env::vars()));
        Self::from_settings_map(&settings)
    }
}

/// Parses `KEY=VALUE` lines; blank lines and `#` comments are ignored.
pub fn parse_settings(contents: &str) -> Result<HashMap<String, String>> {
    let mut settings = HashMap::new();
    for (line_no, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| anyhow!("Settings line {} is not KEY=VALUE: {}", line_no + 1, line))?;
        settings.insert(key.trim().to_ascii_uppercase(), value.trim().to_string());
    }
    Ok(settings)
}

pub fn read_settings_file(path: &Path) -> Result<HashMap<String, String>> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read settings file {}", path.display()))?;
    parse_settings(&contents).with_context(|| format!("Invalid settings file {}", path.display()))
}

pub fn settings_from_env<I>(vars: I) -> HashMap<String, String>
where
    I: IntoIterator<Item = (String, String)>,
{
    vars.into_iter()
        .filter_map(|(key, value)| {
            key.strip_prefix(ENV_PREFIX)
                .map(|stripped| (stripped.to_string(), value))
        })
        .collect()
}

pub fn parse_delimiter(raw: &str) -> Result<u8> {
    match raw {
        "\\t" | "tab" | "TAB" => return Ok(b'\t'),
        _ => {}
    }
    let bytes = raw.as_bytes();
    if bytes.len() != 1 {
        return Err(anyhow!(
            "Delimiter must be a single ASCII character (value: {})",
            raw
        ));
    }
    Ok(bytes[0])
}

fn lookup_setting<'a>(settings: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    settings
        .get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
}

fn setting_f64(
    settings: &HashMap<String, String>,
    key: &str,
    default: f64,
    min: Option<f64>,
    max: Option<f64>,
) -> Result<f64> {
    let Some(raw) = lookup_setting(settings, key) else {
        return Ok(default);
    };
    let value = raw
        .parse::<f64>()
        .map_err(|_| anyhow!("Setting {} must be a number (value: {})", key, raw))?;
    if !value.is_finite() {
        return Err(anyhow!("Setting {} must be finite (value: {})", key, raw));
    }
    if let Some(min_value) = min {
        if value < min_value {
            return Err(anyhow!(
                "Setting {} must be >= {} (value: {})",
                key,
                min_value,
                raw
            ));
        }
    }
    if let Some(max_value) = max {
        if value > max_value {
            return Err(anyhow!(
                "Setting {} must be <= {} (value: {})",
                key,
                max_value,
                raw
            ));
        }
    }
    Ok(value)
}

fn setting_usize(
    settings: &HashMap<String, String>,
    key: &str,
    default: usize,
    min: usize,
) -> Result<usize> {
    let Some(raw) = lookup_setting(settings, key) else {
        return Ok(default);
    };
    parse_usize(key, raw, raw, min)
}

fn parse_usize(key: &str, entry: &str, raw: &str, min: usize) -> Result<usize> {
    let value = entry
        .parse::<f64>()
        .map_err(|_| anyhow!("Setting {} must be a number (value: {})", key, raw))?;
    if !value.is_finite() {
        return Err(anyhow!("Setting {} must be finite (value: {})", key, raw));
    }
    if value.fract() != 0.0 {
        return Err(anyhow!(
            "Setting {} must be an integer (value: {})",
            key,
            raw
        ));
    }
    if value < min as f64 {
        return Err(anyhow!(
            "Setting {} must be >= {} (value: {})",
            key,
            min,
            raw
        ));
    }
    Ok(value as usize)
}

fn setting_bool(settings: &HashMap<String, String>, key: &str, default: bool) -> Result<bool> {
    let Some(raw) = lookup_setting(settings, key) else {
        return Ok(default);
    };
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(anyhow!("Setting {} must be a boolean (value: {})", key, raw)),
    }
}

fn setting_usize_list(settings: &HashMap<String, String>, key: &str) -> Result<Vec<usize>> {
    let raw = lookup_setting(settings, key)
        .ok_or_else(|| anyhow!("Missing required setting {}", key))?;
    let trimmed = raw.trim_matches(|c| c == '[' || c == ']');
    let mut values = Vec::new();

    for part in trimmed.split(|c: char| c == ',' || c.is_whitespace()) {
        let entry = part.trim();
        if entry.is_empty() {
            continue;
        }
        values.push(parse_usize(key, entry, raw, 1)?);
    }

    if values.is_empty() {
        return Err(anyhow!(
            "Setting {} must contain at least one number (value: {})",
            key,
            raw
        ));
    }

    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn empty_map_yields_reference_defaults() {
        let settings = AnalysisSettings::from_settings_map(&HashMap::new()).unwrap();
        assert_eq!(settings, AnalysisSettings::default());
        assert_eq!(settings.horizons, vec![2, 3, 30]);
        assert_eq!(settings.tail_size, 220);
        assert_eq!(settings.forest.tree_count, 1000);
        assert_eq!(settings.forest.random_seed, 1234);
        assert_eq!(settings.forest.parallelism, Parallelism::AllCores);
    }

    #[test]
    fn overrides_are_parsed() {
        let settings = AnalysisSettings::from_settings_map(&map(&[
            ("HORIZONS", "[5, 10,20]"),
            ("NULL_DROP_POLICY", "per-horizon"),
            ("SELECTION_LOWER_BOUND", "0.01"),
            ("SELECTION_UPPER_BOUND", "0.9"),
            ("TAIL_SIZE", "100"),
            ("FOREST_TREE_COUNT", "50"),
            ("FOREST_THREADS", "4"),
            ("FOREST_BOOTSTRAP", "false"),
            ("FOREST_RANDOM_SEED", "7"),
            ("CSV_DELIMITER", ";"),
        ]))
        .unwrap();

        assert_eq!(settings.horizons, vec![5, 10, 20]);
        assert_eq!(settings.null_drop, NullDropPolicy::PerHorizon);
        assert!((settings.selection_lower_bound - 0.01).abs() < 1e-12);
        assert_eq!(settings.tail_size, 100);
        assert_eq!(settings.forest.tree_count, 50);
        assert_eq!(settings.forest.parallelism, Parallelism::Threads(4));
        assert!(!settings.forest.bootstrap);
        assert_eq!(settings.forest.random_seed, 7);
        assert_eq!(settings.delimiter, b';');
    }

    #[test]
    fn invalid_values_are_rejected() {
        for pairs in [
            vec![("HORIZONS", "2,0")],
            vec![("HORIZONS", "3,3")],
            vec![("TAIL_SIZE", "12.5")],
            vec![("FOREST_TREE_COUNT", "0")],
            vec![("SELECTION_LOWER_BOUND", "0.5"), ("SELECTION_UPPER_BOUND", "0.1")],
            vec![("NULL_DROP_POLICY", "sometimes")],
            vec![("CSV_DELIMITER", "::")],
            vec![("FOREST_BOOTSTRAP", "maybe")],
        ] {
            assert!(
                AnalysisSettings::from_settings_map(&map(&pairs)).is_err(),
                "expected failure for {:?}",
                pairs
            );
        }
    }

    #[test]
    fn settings_files_and_env_vars_are_merged() {
        let parsed = parse_settings("# comment\n\nhorizons = 2,3\nTAIL_SIZE=50\n").unwrap();
        assert_eq!(parsed.get("HORIZONS").map(String::as_str), Some("2,3"));
        assert!(parse_settings("just text").is_err());

        let env = settings_from_env(vec![
            ("STOCKML_TAIL_SIZE".to_string(), "60".to_string()),
            ("PATH".to_string(), "/usr/bin".to_string()),
        ]);
        assert_eq!(env, map(&[("TAIL_SIZE", "60")]));

        let mut merged = parsed;
        merged.extend(env);
        let settings = AnalysisSettings::from_settings_map(&merged).unwrap();
        assert_eq!(settings.tail_size, 60);
        assert_eq!(settings.horizons, vec![2, 3]);
    }

    #[test]
    fn tab_delimiters_have_aliases() {
        assert_eq!(parse_delimiter("tab").unwrap(), b'\t');
        assert_eq!(parse_delimiter("\\t").unwrap(), b'\t');
        assert_eq!(parse_delimiter(",").unwrap(), b',');
    }
}
