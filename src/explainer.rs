use crate::model::ForestClassifier;
use crate::models::FeatureMatrix;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

const EXPLAINER_BUNDLE_VERSION: u32 = 1;

pub const CLASS_LABELS: [&str; 2] = ["Decreased Price", "Increased Price"];

/// Fitted classifier plus its held-out rows, enough to rebuild an
/// interactive explanation outside this process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExplainerBundle {
    version: u32,
    pub generated_at: DateTime<Utc>,
    pub instrument: String,
    pub title: String,
    pub model: ForestClassifier,
    pub x_test: FeatureMatrix,
    pub y_test: Vec<f64>,
    pub labels: Vec<String>,
}

impl ExplainerBundle {
    pub fn new(
        instrument: impl Into<String>,
        model: ForestClassifier,
        x_test: FeatureMatrix,
        y_test: Vec<f64>,
    ) -> Self {
        let instrument = instrument.into();
        Self {
            version: EXPLAINER_BUNDLE_VERSION,
            generated_at: Utc::now(),
            title: format!("{} price direction explainer", instrument),
            instrument,
            model,
            x_test,
            y_test,
            labels: CLASS_LABELS.iter().map(|label| label.to_string()).collect(),
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create explainer directory {}", parent.display())
                })?;
            }
        }

        let file = File::create(path)
            .with_context(|| format!("Unable to create explainer bundle at {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        bincode::serialize_into(&mut writer, self)
            .context("Failed to serialize explainer bundle")?;
        writer
            .flush()
            .context("Failed to flush explainer bundle to disk")?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("Failed to open explainer bundle at {}", path.display()))?;
        let bundle: ExplainerBundle = bincode::deserialize_from(BufReader::new(file))
            .context("Explainer bundle decode failed")?;
        if bundle.version != EXPLAINER_BUNDLE_VERSION {
            return Err(anyhow!(
                "Explainer bundle version mismatch (found {}, expected {})",
                bundle.version,
                EXPLAINER_BUNDLE_VERSION
            ));
        }
        Ok(bundle)
    }
}
