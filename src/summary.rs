// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Aggregate failure metrics for the dashboard summary

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

use crate::db::StoredAnalysis;

const UNKNOWN_STEP: &str = "Unknown Step";
const UNKNOWN_ERROR: &str = "Unknown Error";
const UNCATEGORISED: &str = "Uncategorised";

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FeatureFailure {
    pub feature: String,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StepFailure {
    pub step: String,
    pub count: usize,
    pub affected_features: usize,
    pub affected_files: usize,
    pub features: Vec<String>,
    pub files: Vec<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorTypeFailure {
    pub error_type: String,
    pub count: usize,
    pub affected_features: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CategoryFailure {
    pub category: String,
    pub count: usize,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SummaryMetrics {
    pub feature_failures: Vec<FeatureFailure>,
    pub step_failures: Vec<StepFailure>,
    pub error_type_failures: Vec<ErrorTypeFailure>,
    pub category_failures: Vec<CategoryFailure>,
}

#[derive(Default)]
struct Bucket {
    count: usize,
    features: BTreeSet<String>,
    files: BTreeSet<String>,
}

/// Text before the first `:` of an error message, with surrounding whitespace trimmed
pub fn error_type(message: &str) -> &str {
    let head = message.split(':').next().unwrap_or_default().trim();
    if head.is_empty() {
        UNKNOWN_ERROR
    } else {
        head
    }
}

/// Highest count first, ties by key
fn ranked(buckets: BTreeMap<String, Bucket>) -> Vec<(String, Bucket)> {
    let mut ranked: Vec<(String, Bucket)> = buckets.into_iter().collect();
    ranked.sort_by(|a, b| b.1.count.cmp(&a.1.count).then_with(|| a.0.cmp(&b.0)));
    ranked
}

/// Compute dashboard metrics. Each stored analysis counts once per occurrence.
pub fn summarize(results: &[StoredAnalysis]) -> SummaryMetrics {
    let mut features: BTreeMap<String, Bucket> = BTreeMap::new();
    let mut steps: BTreeMap<String, Bucket> = BTreeMap::new();
    let mut errors: BTreeMap<String, Bucket> = BTreeMap::new();
    let mut categories: BTreeMap<String, Bucket> = BTreeMap::new();

    for result in results {
        let a = &result.analysis;
        let weight = result.occurrences.max(1) as usize;

        features.entry(a.feature_name.clone()).or_default().count += weight;

        let step_key = if a.step_details.is_empty() {
            UNKNOWN_STEP
        } else {
            a.step_details.as_str()
        };
        let step = steps.entry(step_key.to_string()).or_default();
        step.count += weight;
        step.features.insert(a.feature_name.clone());
        step.files.insert(a.file_path.clone());

        let error = errors.entry(error_type(&a.error_message).to_string()).or_default();
        error.count += weight;
        error.features.insert(a.feature_name.clone());

        let category = a
            .error_category
            .as_deref()
            .filter(|c| !c.is_empty())
            .unwrap_or(UNCATEGORISED);
        categories.entry(category.to_string()).or_default().count += weight;
    }

    SummaryMetrics {
        feature_failures: ranked(features)
            .into_iter()
            .map(|(feature, b)| FeatureFailure { feature, failed: b.count })
            .collect(),
        step_failures: ranked(steps)
            .into_iter()
            .map(|(step, b)| StepFailure {
                step,
                count: b.count,
                affected_features: b.features.len(),
                affected_files: b.files.len(),
                features: b.features.into_iter().collect(),
                files: b.files.into_iter().collect(),
            })
            .collect(),
        error_type_failures: ranked(errors)
            .into_iter()
            .map(|(error_type, b)| ErrorTypeFailure {
                error_type,
                count: b.count,
                affected_features: b.features.len(),
            })
            .collect(),
        category_failures: ranked(categories)
            .into_iter()
            .map(|(category, b)| CategoryFailure { category, count: b.count })
            .collect(),
    }
}
