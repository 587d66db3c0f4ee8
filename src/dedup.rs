// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Fingerprinting and deduplication of repeated failures

use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

use crate::report::StructuredFailure;

fn volatile_pattern() -> &'static Regex {
    // uuids, long hex ids, then any digit run
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}|0x[0-9a-f]+|\b[0-9a-f]{12,}\b|\d+")
            .expect("valid volatile token regex")
    })
}

fn whitespace_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\s+").expect("valid whitespace regex"))
}

/// Replace ids, counters and timings with `#` and collapse whitespace
pub fn normalize_error(message: &str) -> String {
    let replaced = volatile_pattern().replace_all(message, "#");
    whitespace_pattern().replace_all(replaced.trim(), " ").into_owned()
}

/// Stable identity of a failure across runs
pub fn fingerprint(failure: &StructuredFailure) -> String {
    let mut hasher = blake3::Hasher::new();
    for part in [
        failure.feature_name.as_str(),
        failure.scenario_name.as_str(),
        failure.step_details.as_str(),
        &normalize_error(&failure.error_message),
    ] {
        hasher.update(part.as_bytes());
        hasher.update(&[0x1f]);
    }
    hasher.finalize().to_hex().to_string()
}

/// A distinct failure and how often it appeared in the run
#[derive(Debug, Clone)]
pub struct UniqueFailure {
    pub fingerprint: String,
    pub failure: StructuredFailure,
    pub occurrences: usize,
}

/// Collapse failures with the same fingerprint, keeping first-seen order
pub fn dedup_failures(failures: Vec<StructuredFailure>) -> Vec<UniqueFailure> {
    let mut unique: Vec<UniqueFailure> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for failure in failures {
        let fp = fingerprint(&failure);
        match index.get(&fp) {
            Some(&pos) => unique[pos].occurrences += 1,
            None => {
                index.insert(fp.clone(), unique.len());
                unique.push(UniqueFailure {
                    fingerprint: fp,
                    failure,
                    occurrences: 1,
                });
            }
        }
    }

    unique
}

/// Wrap every failure as its own entry (deduplication disabled)
pub fn keep_all(failures: Vec<StructuredFailure>) -> Vec<UniqueFailure> {
    failures
        .into_iter()
        .map(|failure| UniqueFailure {
            fingerprint: fingerprint(&failure),
            failure,
            occurrences: 1,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(scenario: &str, error: &str) -> StructuredFailure {
        StructuredFailure {
            error_message: error.to_string(),
            step_details: "I open the order".to_string(),
            feature_name: "Orders".to_string(),
            scenario_name: scenario.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn volatile_tokens_are_masked() {
        assert_eq!(
            normalize_error("Timeout 30000ms exceeded for order 3f2b8c1e-1111-4222-8333-abcdefabcdef\n  at x.ts:12"),
            "Timeout #ms exceeded for order # at x.ts:#"
        );
    }

    #[test]
    fn reruns_share_a_fingerprint() {
        let a = failure("View", "Timeout 30000ms exceeded (request 0x1f2e)");
        let b = failure("View", "Timeout 45000ms exceeded (request 0x99aa)");
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn different_scenarios_differ() {
        let a = failure("View", "boom");
        let b = failure("Edit", "boom");
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn field_boundaries_matter() {
        let mut a = failure("ab", "c");
        a.step_details = String::new();
        let mut b = failure("a", "c");
        b.step_details = "b".to_string();
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn dedup_counts_and_keeps_order() {
        let unique = dedup_failures(vec![
            failure("A", "e1"),
            failure("B", "x"),
            failure("A", "e2"),
            failure("A", "e3"),
        ]);
        assert_eq!(unique.len(), 2);
        assert_eq!(unique[0].failure.scenario_name, "A");
        assert_eq!(unique[0].occurrences, 3);
        assert_eq!(unique[1].occurrences, 1);
    }

    #[test]
    fn keep_all_preserves_duplicates() {
        let all = keep_all(vec![failure("A", "e"), failure("A", "e")]);
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].fingerprint, all[1].fingerprint);
    }
}
