// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Cucumber JSON report parser

use regex::Regex;
use std::sync::OnceLock;
use tracing::{debug, info};

use super::{Embedding, Feature, RawFailure, ReportParser, StructuredFailure};

const FAILED: &str = "failed";

fn file_path_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"at (.+?):").expect("valid file path regex"))
}

fn line_number_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r":(\d+)").expect("valid line number regex"))
}

/// Parser for Cucumber JSON reports
#[derive(Debug, Clone, Copy, Default)]
pub struct CucumberParser;

impl CucumberParser {
    pub fn new() -> Self {
        Self
    }

    /// Data of the first PNG attachment, or empty
    pub fn extract_screenshot(embeddings: &[Embedding]) -> String {
        embeddings
            .iter()
            .find(|e| e.mime_type == "image/png")
            .map(|e| e.data.clone())
            .unwrap_or_default()
    }

    /// Source path from an `at path:line` stack frame
    pub fn extract_file_path(error_message: &str) -> String {
        file_path_pattern()
            .captures(error_message)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .unwrap_or_default()
    }

    /// First `:<digits>` in the message
    pub fn extract_line_number(error_message: &str) -> String {
        line_number_pattern()
            .captures(error_message)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .unwrap_or_default()
    }
}

impl ReportParser for CucumberParser {
    fn extract_failures(&self, report: &[Feature]) -> Vec<RawFailure> {
        info!("Extracting failures from Cucumber report");
        let mut failures = Vec::new();

        for feature in report {
            for scenario in &feature.elements {
                // Screenshots are attached by the after hook, i.e. the last step
                let embeddings = scenario
                    .steps
                    .last()
                    .map(|s| s.embeddings.clone())
                    .unwrap_or_default();

                for step in scenario.steps.iter().filter(|s| s.result.status == FAILED) {
                    debug!("Failed step in {:?} / {:?}: {}", feature.name, scenario.name, step.name);
                    failures.push(RawFailure {
                        feature: feature.name.clone(),
                        scenario: scenario.name.clone(),
                        step: step.name.clone(),
                        error_message: step.result.error_message.clone(),
                        embeddings: embeddings.clone(),
                    });
                }
            }
        }

        info!("Found {} failed scenarios", failures.len());
        failures
    }

    fn structure_failure(&self, failure: &RawFailure) -> StructuredFailure {
        let error_message = failure.error_message.clone().unwrap_or_default();
        StructuredFailure {
            file_path: Self::extract_file_path(&error_message),
            line_number: Self::extract_line_number(&error_message),
            step_details: failure.step.clone(),
            feature_name: failure.feature.clone(),
            scenario_name: failure.scenario.clone(),
            screenshot: Self::extract_screenshot(&failure.embeddings),
            error_message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::parse_report;

    const REPORT: &str = r#"[
      {
        "name": "Checkout",
        "uri": "features/checkout.feature",
        "elements": [
          {
            "name": "Pay with card",
            "steps": [
              {"name": "a basket", "result": {"status": "passed"}},
              {"name": "I pay", "result": {"status": "failed",
                "error_message": "AssertionError: expected 200\n    at src/steps/pay.ts:42:7"}},
              {"name": "receipt shown", "result": {"status": "skipped"}},
              {"name": "after hook", "result": {"status": "passed"},
               "embeddings": [
                 {"mime_type": "text/plain", "data": "log"},
                 {"mime_type": "image/png", "data": "iVBORw0KGgo"}
               ]}
            ]
          },
          {
            "name": "Pay with voucher",
            "steps": [{"name": "I redeem", "result": {"status": "passed"}}]
          }
        ]
      }
    ]"#;

    #[test]
    fn only_failed_steps_are_extracted() {
        let report = parse_report(REPORT.as_bytes()).unwrap();
        let failures = CucumberParser::new().extract_failures(&report);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].feature, "Checkout");
        assert_eq!(failures[0].scenario, "Pay with card");
        assert_eq!(failures[0].step, "I pay");
        // embeddings come from the scenario's last step
        assert_eq!(failures[0].embeddings.len(), 2);
    }

    #[test]
    fn structured_failure_scrapes_location_and_screenshot() {
        let report = parse_report(REPORT.as_bytes()).unwrap();
        let parser = CucumberParser::new();
        let failures = parser.failures(&report);
        let f = &failures[0];
        assert_eq!(f.file_path, "src/steps/pay.ts");
        assert_eq!(f.line_number, "42");
        assert_eq!(f.screenshot, "iVBORw0KGgo");
        assert_eq!(f.step_details, "I pay");
    }

    #[test]
    fn missing_error_message_yields_empty_fields() {
        let raw = RawFailure {
            feature: "F".to_string(),
            scenario: "S".to_string(),
            step: "step".to_string(),
            error_message: None,
            embeddings: vec![],
        };
        let f = CucumberParser::new().structure_failure(&raw);
        assert_eq!(f.error_message, "");
        assert_eq!(f.file_path, "");
        assert_eq!(f.line_number, "");
        assert_eq!(f.screenshot, "");
    }

    #[test]
    fn line_number_takes_first_colon_digits() {
        assert_eq!(CucumberParser::extract_line_number("Timeout: 30000ms at a.js:12"), "12");
        assert_eq!(CucumberParser::extract_line_number("Timeout:30000ms at a.js:12"), "30000");
        assert_eq!(CucumberParser::extract_line_number("at a.js:12:3"), "12");
        assert_eq!(CucumberParser::extract_file_path("no frames here"), "");
    }
}
