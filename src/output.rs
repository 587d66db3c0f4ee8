// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Parsing of model responses into structured failure analyses

use serde::{Deserialize, Deserializer, Serialize};

use crate::{AnalyserError, Result};

/// One analysed test failure as returned by the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureAnalysis {
    /// Detailed reason for the failure
    pub detailed_reason: String,
    /// The raw error message from the test
    pub error_message: String,
    /// Squad responsible for the feature
    #[serde(default)]
    pub squad_name: String,
    #[serde(default)]
    pub possible_causes: Vec<String>,
    #[serde(default)]
    pub recommended_fixes: Vec<String>,
    pub feature_name: String,
    pub scenario_name: String,
    /// Step where the failure occurred
    pub step_details: String,
    #[serde(default)]
    pub file_path: String,
    #[serde(default, deserialize_with = "string_or_number")]
    pub line_number: String,
    /// Test Data / Script / Environment / Other issue
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_category: Option<String>,
}

fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(serde_json::Number),
        Null(()),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Text(s) => s,
        Raw::Number(n) => n.to_string(),
        Raw::Null(()) => String::new(),
    })
}

/// Remove markdown code fences and any chatter around them
pub fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(open) = trimmed.find("```") else {
        return trimmed;
    };

    let after_open = &trimmed[open + 3..];
    // Skip the language tag on the opening fence line
    let body_start = match after_open.find('\n') {
        Some(nl) if !after_open[..nl].contains('{') && !after_open[..nl].contains('[') => nl + 1,
        _ => after_open
            .char_indices()
            .find(|(_, c)| !c.is_alphanumeric())
            .map(|(i, _)| i)
            .unwrap_or(after_open.len()),
    };
    let body = &after_open[body_start..];

    match body.rfind("```") {
        Some(close) => body[..close].trim(),
        None => body.trim(),
    }
}

/// Parse a model response into analyses.
///
/// Accepts a JSON array or a single object; a single object becomes a
/// one-element vec.
pub fn parse_analyses(text: &str) -> Result<Vec<FailureAnalysis>> {
    let cleaned = strip_code_fences(text);

    let value: serde_json::Value = serde_json::from_str(cleaned).map_err(|e| AnalyserError::OutputParse {
        text: cleaned.to_string(),
        reason: e.to_string(),
    })?;

    let parsed = match value {
        serde_json::Value::Array(_) => serde_json::from_value::<Vec<FailureAnalysis>>(value),
        other => serde_json::from_value::<FailureAnalysis>(other).map(|a| vec![a]),
    };

    parsed.map_err(|e| AnalyserError::OutputParse {
        text: cleaned.to_string(),
        reason: e.to_string(),
    })
}
