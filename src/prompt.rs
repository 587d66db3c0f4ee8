// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Prompt templates for failure analysis

use minijinja::{context, Environment};
use serde::Serialize;

use crate::report::StructuredFailure;
use crate::Result;

/// Template used for API test reports (many failures per request)
pub const DEFAULT_API_TEMPLATE: &str = r#"
Analyze the error message to determine the reason for the failure.

Error Details: {{ failure_details }}

Generate a JSON object representing the following information based on the error details.

The output should be valid JSON and should not contain unnecessary escape characters.

File Path Handling:
Return only the portion of the file path starting from 'src'. If the path doesn't contain 'src', use 'other'.

Error Category Determination Logic:
- Test Data Issue: Classify as "Test Data Issue" if the error message says the specified customer or record could not be found, or data validation prevented the call.
- Script Issue: Classify as "Script Issue" if the error message contains "could not be found within the specified timeout" or other indications of timing issues, incorrect locators, or problems with the test script's logic.
- Environment Issue: Classify as "Environment Issue" if the error points at unavailable services, gateway errors, timeouts waiting for responses or connection resets.
- Other Issue: If the failure file path is not in the project root, classify as "Other Issue".

Important Considerations:
* Provide detailed and actionable insights.
* Return ONLY an array of JSON objects, one per failure, no extra text.
* Handle all escape characters so the JSON parses without cleanup.

{{ format_instructions }}
"#;

/// Template used for UI test reports (one failure plus screenshot per request)
pub const DEFAULT_UI_TEMPLATE: &str = r#"
Analyze the error message and the attached screenshot to determine the reason for the failure.

Error Details: {{ failure_details }}

Generate a JSON object representing the following information based on the error details and screenshot analysis.

The output should be valid JSON and should not contain unnecessary escape characters.

File Path Handling:
Return only the portion of the file path starting from 'src'. If the path doesn't contain 'src', use 'other'.

Error Category Determination Logic:
- Test Data Issue: the screenshot or message shows missing customers, missing records or a data validation error that prevented an action.
- Script Issue: an element could not be found within the specified timeout, a locator is wrong, or page.waitForResponse timed out while the screenshot shows a fully loaded page.
- Environment Issue: page.waitForResponse timed out AND the screenshot shows a persistent loader, a "something went wrong" message, a reload button or a blank page.
- Other Issue: the failure file path is not in the project root.

Important Considerations:
* Provide detailed and actionable insights.
* Return ONLY an array containing the JSON object, no extra text.
* Handle all escape characters so the JSON parses without cleanup.

{{ format_instructions }}
"#;

#[derive(Serialize)]
struct FieldSpec {
    #[serde(rename = "type")]
    kind: &'static str,
    description: &'static str,
}

const FIELDS: &[(&str, &str, &str)] = &[
    ("detailed_reason", "string", "Detailed reason for the failure."),
    ("error_message", "string", "The raw error message from the test."),
    ("squad_name", "string", "Name of the squad responsible for the feature."),
    ("possible_causes", "array of strings", "List of possible causes for the failure."),
    ("recommended_fixes", "array of strings", "List of recommended fixes for the failure."),
    ("feature_name", "string", "Name of the feature under test."),
    ("scenario_name", "string", "Name of the specific scenario that failed."),
    ("step_details", "string", "Details of the test step where the failure occurred."),
    ("file_path", "string", "Path to the test file."),
    ("line_number", "string", "Line number in the test file where the failure occurred."),
    ("error_category", "string", "One of: Test Data Issue, Script Issue, Environment Issue, Other Issue."),
];

/// Describe the expected output shape to the model
pub fn format_instructions() -> String {
    let properties: serde_json::Map<String, serde_json::Value> = FIELDS
        .iter()
        .map(|&(name, kind, description)| {
            let spec = serde_json::to_value(FieldSpec { kind, description }).unwrap_or_default();
            (name.to_string(), spec)
        })
        .collect();

    let required: Vec<&str> = FIELDS.iter().map(|&(name, _, _)| name).collect();
    let schema = serde_json::json!({
        "type": "array",
        "items": {
            "type": "object",
            "properties": properties,
            "required": required,
        }
    });

    format!(
        "The output must be a JSON array conforming to the schema below.\n```\n{}\n```",
        serde_json::to_string_pretty(&schema).unwrap_or_default()
    )
}

/// A prompt template with `failure_details` and `format_instructions` slots
#[derive(Debug, Clone)]
pub struct PromptTemplate {
    source: String,
}

impl PromptTemplate {
    /// Compile-check and wrap a template source
    pub fn new(source: impl Into<String>) -> Result<Self> {
        let source = source.into();
        {
            let env = Environment::new();
            env.template_from_str(&source)?;
        }
        Ok(Self { source })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Render the prompt for a set of failures. Screenshots are never included.
    pub fn render(&self, failures: &[StructuredFailure], format_instructions: &str) -> Result<String> {
        let failure_details = serde_json::to_string_pretty(failures)?;
        let env = Environment::new();
        let rendered = env.render_str(
            &self.source,
            context! {
                failure_details => failure_details,
                format_instructions => format_instructions,
            },
        )?;
        Ok(rendered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure() -> StructuredFailure {
        StructuredFailure {
            error_message: "Expected <b>200</b> got 500".to_string(),
            step_details: "I call the orders API".to_string(),
            feature_name: "Orders".to_string(),
            scenario_name: "List orders".to_string(),
            screenshot: "iVBORw0KGgo".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn render_fills_both_slots() {
        let template = PromptTemplate::new(DEFAULT_API_TEMPLATE).unwrap();
        let prompt = template.render(&[failure()], &format_instructions()).unwrap();
        assert!(prompt.contains("I call the orders API"));
        assert!(prompt.contains("\"recommended_fixes\""));
        assert!(!prompt.contains("{{"));
    }

    #[test]
    fn render_never_leaks_screenshot_or_escapes_html() {
        let template = PromptTemplate::new(DEFAULT_UI_TEMPLATE).unwrap();
        let prompt = template.render(&[failure()], "").unwrap();
        assert!(!prompt.contains("iVBORw0KGgo"));
        assert!(prompt.contains("<b>200</b>"));
    }

    #[test]
    fn broken_template_is_rejected() {
        assert!(PromptTemplate::new("{{ failure_details ").is_err());
    }

    #[test]
    fn instructions_list_every_field() {
        let instructions = format_instructions();
        for &(name, _, _) in FIELDS {
            assert!(instructions.contains(name), "missing {name}");
        }
    }
}
