// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Test report model and failure extraction

pub mod cucumber;

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use crate::{AnalyserError, Result};

pub use cucumber::CucumberParser;

/// A feature file entry in a Cucumber JSON report
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Feature {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub uri: String,
    #[serde(default)]
    pub elements: Vec<Scenario>,
}

/// A scenario (or background) inside a feature
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Scenario {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub keyword: String,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub tags: Vec<Tag>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Tag {
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Step {
    #[serde(default)]
    pub keyword: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub result: StepResult,
    #[serde(default)]
    pub embeddings: Vec<Embedding>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepResult {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub duration: Option<u64>,
}

/// Attachment captured during a step, usually a base64 screenshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Embedding {
    #[serde(default, alias = "media_type")]
    pub mime_type: String,
    #[serde(default)]
    pub data: String,
}

/// A failed step as found in the report
#[derive(Debug, Clone)]
pub struct RawFailure {
    pub feature: String,
    pub scenario: String,
    pub step: String,
    pub error_message: Option<String>,
    pub embeddings: Vec<Embedding>,
}

/// A failure normalised for prompting and storage.
///
/// The screenshot never appears in the serialised form; it only travels as
/// an image attachment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StructuredFailure {
    pub error_message: String,
    pub step_details: String,
    pub feature_name: String,
    pub scenario_name: String,
    pub file_path: String,
    pub line_number: String,
    #[serde(skip)]
    pub screenshot: String,
}

impl StructuredFailure {
    /// Copy of this failure with the screenshot removed
    pub fn without_screenshot(&self) -> Self {
        Self {
            screenshot: String::new(),
            ..self.clone()
        }
    }

    /// Size of the failure as it appears inside a prompt
    pub fn prompt_len(&self) -> usize {
        serde_json::to_string(self).map(|s| s.len()).unwrap_or(usize::MAX)
    }
}

/// Trait for report parsers
pub trait ReportParser: Send + Sync {
    /// Pull every failed step out of a report
    fn extract_failures(&self, report: &[Feature]) -> Vec<RawFailure>;

    /// Turn a raw failure into the standard shape
    fn structure_failure(&self, failure: &RawFailure) -> StructuredFailure;

    /// Extract and structure in one pass
    fn failures(&self, report: &[Feature]) -> Vec<StructuredFailure> {
        self.extract_failures(report)
            .iter()
            .map(|f| self.structure_failure(f))
            .collect()
    }
}

/// Parse a report from memory. Accepts an array of features or a single feature.
pub fn parse_report(bytes: &[u8]) -> Result<Vec<Feature>> {
    let value: serde_json::Value = serde_json::from_slice(bytes)
        .map_err(|e| AnalyserError::Report(format!("Invalid JSON: {}", e)))?;

    let features = match value {
        serde_json::Value::Array(_) => serde_json::from_value(value),
        serde_json::Value::Object(_) => serde_json::from_value(value).map(|f: Feature| vec![f]),
        _ => {
            return Err(AnalyserError::Report(
                "Expected an array of features or a feature object".to_string(),
            ))
        }
    };

    features.map_err(|e| AnalyserError::Report(format!("Unexpected report structure: {}", e)))
}

/// Read and parse a report from disk
pub fn load_report(path: &Path) -> Result<Vec<Feature>> {
    let bytes = std::fs::read(path)?;
    let features = parse_report(&bytes)?;
    info!("Loaded {} features from {:?}", features.len(), path);
    Ok(features)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_feature_object_is_wrapped() {
        let features = parse_report(br#"{"name": "Login", "elements": []}"#).unwrap();
        assert_eq!(features.len(), 1);
        assert_eq!(features[0].name, "Login");
    }

    #[test]
    fn scalar_report_is_rejected() {
        assert!(matches!(parse_report(b"42"), Err(AnalyserError::Report(_))));
        assert!(matches!(parse_report(b"not json"), Err(AnalyserError::Report(_))));
    }

    #[test]
    fn missing_fields_default() {
        let features = parse_report(br#"[{"elements": [{"steps": [{"result": {}}]}]}]"#).unwrap();
        let step = &features[0].elements[0].steps[0];
        assert_eq!(step.result.status, "");
        assert!(step.embeddings.is_empty());
    }

    #[test]
    fn screenshot_is_not_serialised() {
        let failure = StructuredFailure {
            error_message: "boom".to_string(),
            screenshot: "iVBORw0KGgo".to_string(),
            ..Default::default()
        };
        let json = serde_json::to_string(&failure).unwrap();
        assert!(!json.contains("iVBORw0KGgo"));
        assert!(!json.contains("screenshot"));
        assert_eq!(failure.prompt_len(), json.len());
    }
}
