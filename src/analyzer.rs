// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! End-to-end analysis of a Cucumber report
//!
//! Failures are extracted, structured and collapsed by fingerprint. Failures
//! already analysed in an earlier run are answered from the database, the
//! rest go through the [`FailureChain`]. Results are persisted when a
//! database is supplied.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::chain::{ChainOutcome, FailureChain, RequestError};
use crate::config::AppConfig;
use crate::db::{new_id, Database, RunRecord, StoredAnalysis};
use crate::dedup::{dedup_failures, fingerprint, keep_all, normalize_error, UniqueFailure};
use crate::llm::LlmClient;
use crate::output::FailureAnalysis;
use crate::report::{load_report, CucumberParser, Feature, ReportParser, StructuredFailure};
use crate::Result;

/// Kind of test run a report comes from
pub use crate::chain::ChainMode as ReportKind;

/// Analysis of one distinct failure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalysedFailure {
    pub fingerprint: String,
    pub occurrences: usize,
    pub reused: bool,
    #[serde(flatten)]
    pub analysis: FailureAnalysis,
}

/// Everything produced by analysing one report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisRun {
    pub run_id: String,
    pub kind: ReportKind,
    pub source: String,
    pub total_failures: usize,
    pub unique_failures: usize,
    pub reused: usize,
    pub results: Vec<AnalysedFailure>,
    pub errors: Vec<RequestError>,
    /// `feature / scenario` of failures too large to send
    pub dropped: Vec<String>,
}

impl AnalysisRun {
    /// Distinct failures with no analysis (request errors or dropped)
    pub fn unanalysed(&self) -> usize {
        self.unique_failures.saturating_sub(self.results.len())
    }
}

pub struct FailureAnalyzer {
    config: AppConfig,
    client: Arc<dyn LlmClient>,
    kind: ReportKind,
    parser: Box<dyn ReportParser>,
}

impl FailureAnalyzer {
    pub fn new(config: AppConfig, client: Arc<dyn LlmClient>, kind: ReportKind) -> Self {
        Self {
            config,
            client,
            kind,
            parser: Box::new(CucumberParser::new()),
        }
    }

    pub fn with_parser(mut self, parser: Box<dyn ReportParser>) -> Self {
        self.parser = parser;
        self
    }

    pub fn kind(&self) -> ReportKind {
        self.kind
    }

    /// Load a report from disk and analyse it
    pub async fn analyze_file(&self, path: &Path, db: Option<&Database>) -> Result<AnalysisRun> {
        let features = load_report(path)?;
        self.analyze_source(&path.display().to_string(), &features, db).await
    }

    /// Analyse an already parsed report
    pub async fn analyze_report(&self, features: &[Feature], db: Option<&Database>) -> Result<AnalysisRun> {
        self.analyze_source("inline", features, db).await
    }

    /// Analyse a report, labelling the run with `source`
    pub async fn analyze_source(
        &self,
        source: &str,
        features: &[Feature],
        db: Option<&Database>,
    ) -> Result<AnalysisRun> {
        let failures = self.parser.failures(features);
        let total_failures = failures.len();
        info!("Found {} failed steps in {}", total_failures, source);

        let unique = if self.config.dedup.enabled {
            dedup_failures(failures)
        } else {
            keep_all(failures)
        };
        let unique_failures = unique.len();
        if unique_failures < total_failures {
            info!("{} distinct failures after deduplication", unique_failures);
        }

        let (mut results, fresh) = self.split_known(unique, db)?;
        let reused = results.len();

        let mut errors = Vec::new();
        let mut dropped = Vec::new();

        if !fresh.is_empty() {
            let occurrences = occurrence_index(&fresh);
            let chain = FailureChain::from_config(self.client.clone(), &self.config, self.kind)?;
            let outcome = chain.run(fresh.into_iter().map(|u| u.failure).collect()).await;

            dropped = outcome
                .dropped
                .iter()
                .map(|f| format!("{} / {}", f.feature_name, f.scenario_name))
                .collect();
            errors = outcome.errors.clone();
            results.extend(attach_fingerprints(outcome, &occurrences));
        }

        let run = AnalysisRun {
            run_id: new_id(),
            kind: self.kind,
            source: source.to_string(),
            total_failures,
            unique_failures,
            reused,
            results,
            errors,
            dropped,
        };

        info!(
            "Run {}: {} analyses ({} reused), {} request errors, {} dropped",
            run.run_id,
            run.results.len(),
            run.reused,
            run.errors.len(),
            run.dropped.len()
        );

        if let Some(db) = db {
            persist_run(db, &run)?;
        }

        Ok(run)
    }

    /// Separate failures with a stored analysis from those needing the model
    fn split_known(
        &self,
        unique: Vec<UniqueFailure>,
        db: Option<&Database>,
    ) -> Result<(Vec<AnalysedFailure>, Vec<UniqueFailure>)> {
        let db = match db {
            Some(db) if self.config.dedup.enabled && self.config.dedup.reuse_previous_analyses => db,
            _ => return Ok((Vec::new(), unique)),
        };

        let mut known = Vec::new();
        let mut fresh = Vec::new();
        for item in unique {
            match db.find_by_fingerprint(&item.fingerprint)? {
                Some(stored) => {
                    debug!("Reusing analysis {} for {}", stored.id, item.fingerprint);
                    known.push(AnalysedFailure {
                        fingerprint: item.fingerprint,
                        occurrences: item.occurrences,
                        reused: true,
                        analysis: stored.analysis,
                    });
                }
                None => fresh.push(item),
            }
        }

        if !known.is_empty() {
            info!("{} failures already analysed in earlier runs", known.len());
        }
        Ok((known, fresh))
    }
}

fn occurrence_index(items: &[UniqueFailure]) -> HashMap<String, usize> {
    let mut index = HashMap::new();
    for item in items {
        let count = index.entry(item.fingerprint.clone()).or_insert(0);
        *count = (*count).max(item.occurrences);
    }
    index
}

fn same_names(analysis: &FailureAnalysis, failure: &StructuredFailure) -> bool {
    analysis.feature_name == failure.feature_name
        && analysis.scenario_name == failure.scenario_name
        && analysis.step_details == failure.step_details
}

fn same_error(analysis: &FailureAnalysis, failure: &StructuredFailure) -> bool {
    same_names(analysis, failure)
        && normalize_error(&analysis.error_message) == normalize_error(&failure.error_message)
}

/// Pick the failure an analysis describes, consuming it from `used`.
///
/// Prefers an exact match including the normalised error, then a match on
/// feature, scenario and step, then the failure at the same position.
fn claim_failure<'a>(
    analysis: &FailureAnalysis,
    pos: usize,
    failures: &'a [StructuredFailure],
    used: &mut [bool],
) -> Option<&'a StructuredFailure> {
    let unused = |i: &usize| !used[*i];
    let idx = (0..failures.len())
        .filter(unused)
        .find(|&i| same_error(analysis, &failures[i]))
        .or_else(|| (0..failures.len()).filter(unused).find(|&i| same_names(analysis, &failures[i])))
        .or_else(|| Some(pos).filter(|p| *p < failures.len() && !used[*p]))
        .or_else(|| (0..failures.len()).find(unused))?;

    used[idx] = true;
    Some(&failures[idx])
}

/// Map each analysis back to the failure it describes.
///
/// Every failure is claimed at most once, so outline rows sharing a scenario
/// and step keep their own fingerprints.
fn attach_fingerprints(outcome: ChainOutcome, occurrences: &HashMap<String, usize>) -> Vec<AnalysedFailure> {
    let mut attached = Vec::new();

    for request in outcome.completed {
        if request.analyses.len() != request.failures.len() {
            warn!(
                "Request with {} failures returned {} analyses",
                request.failures.len(),
                request.analyses.len()
            );
        }

        let mut used = vec![false; request.failures.len()];
        for (pos, analysis) in request.analyses.into_iter().enumerate() {
            let fp = match claim_failure(&analysis, pos, &request.failures, &mut used) {
                Some(failure) => fingerprint(failure),
                None => fingerprint(&StructuredFailure {
                    error_message: analysis.error_message.clone(),
                    step_details: analysis.step_details.clone(),
                    feature_name: analysis.feature_name.clone(),
                    scenario_name: analysis.scenario_name.clone(),
                    ..Default::default()
                }),
            };

            attached.push(AnalysedFailure {
                occurrences: occurrences.get(&fp).copied().unwrap_or(1),
                fingerprint: fp,
                reused: false,
                analysis,
            });
        }
    }

    attached
}

/// Store the run, its analyses and the fingerprint sightings atomically
pub fn persist_run(db: &Database, run: &AnalysisRun) -> Result<()> {
    let now = Utc::now();
    let record = RunRecord {
        id: run.run_id.clone(),
        source: run.source.clone(),
        kind: run.kind.to_string(),
        total_failures: run.total_failures as i64,
        unique_failures: run.unique_failures as i64,
        reused: run.reused as i64,
        error_count: run.errors.len() as i64,
        created_at: now,
    };

    let analyses: Vec<StoredAnalysis> = run
        .results
        .iter()
        .map(|result| StoredAnalysis {
            id: new_id(),
            run_id: run.run_id.clone(),
            fingerprint: result.fingerprint.clone(),
            analysis: result.analysis.clone(),
            occurrences: result.occurrences as i64,
            reused: result.reused,
            created_at: now,
        })
        .collect();

    db.store_run(&record, &analyses)?;
    debug!("Stored run {} with {} analyses", run.run_id, analyses.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmMessage;
    use crate::report::parse_report;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Answers every failure in the prompt, optionally renaming scenarios
    struct Scripted {
        calls: AtomicUsize,
        rename: bool,
    }

    impl Scripted {
        fn new(rename: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                rename,
            })
        }
    }

    #[async_trait]
    impl LlmClient for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        fn model(&self) -> &str {
            "scripted-1"
        }

        async fn generate(&self, message: &LlmMessage) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let start = message.text.find('[').unwrap();
            let end = message.text.rfind(']').unwrap();
            let failures: Vec<StructuredFailure> = serde_json::from_str(&message.text[start..=end]).unwrap();
            let analyses: Vec<serde_json::Value> = failures
                .iter()
                .map(|f| {
                    let scenario = if self.rename {
                        format!("Scenario: {}", f.scenario_name)
                    } else {
                        f.scenario_name.clone()
                    };
                    serde_json::json!({
                        "detailed_reason": format!("{} broke", f.step_details),
                        "error_message": f.error_message,
                        "feature_name": f.feature_name,
                        "scenario_name": scenario,
                        "step_details": f.step_details,
                        "line_number": 3,
                    })
                })
                .collect();
            Ok(serde_json::to_string(&analyses).unwrap())
        }
    }

    fn config() -> AppConfig {
        let mut config = AppConfig::default();
        config.prompts.api = "{{ failure_details }}".to_string();
        config.prompts.ui = "{{ failure_details }}".to_string();
        config.batching.delay_between_batches_secs = 0;
        config
    }

    fn report() -> Vec<Feature> {
        let failed = |name: &str, error: &str| {
            serde_json::json!({
                "keyword": "When", "name": name,
                "result": {"status": "failed", "error_message": error}
            })
        };
        let passed = serde_json::json!({"keyword": "Given", "name": "a user", "result": {"status": "passed"}});
        let doc = serde_json::json!([
            {"name": "Checkout", "uri": "features/checkout.feature", "elements": [
                {"name": "Pay", "steps": [passed, failed("I pay", "Timeout 30000ms at src/pay.ts:4")]},
                {"name": "Pay", "steps": [passed, failed("I pay", "Timeout 31000ms at src/pay.ts:4")]},
                {"name": "Refund", "steps": [failed("I refund", "AssertionError: expected 200")]}
            ]}
        ]);
        parse_report(doc.to_string().as_bytes()).unwrap()
    }

    #[tokio::test]
    async fn repeated_failures_are_analysed_once() {
        let client = Scripted::new(false);
        let analyzer = FailureAnalyzer::new(config(), client.clone(), ReportKind::Api);
        let run = analyzer.analyze_report(&report(), None).await.unwrap();

        assert_eq!(run.total_failures, 3);
        assert_eq!(run.unique_failures, 2);
        assert_eq!(run.results.len(), 2);
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);

        let pay = run.results.iter().find(|r| r.analysis.scenario_name == "Pay").unwrap();
        assert_eq!(pay.occurrences, 2);
        assert_eq!(pay.analysis.line_number, "3");
        assert!(!pay.reused);
    }

    #[tokio::test]
    async fn dedup_disabled_sends_every_failure() {
        let client = Scripted::new(false);
        let mut config = config();
        config.dedup.enabled = false;
        let run = FailureAnalyzer::new(config, client, ReportKind::Ui)
            .analyze_report(&report(), None)
            .await
            .unwrap();

        assert_eq!(run.unique_failures, 3);
        assert_eq!(run.results.len(), 3);
        assert!(run.results.iter().all(|r| r.occurrences == 1));
    }

    #[tokio::test]
    async fn second_run_reuses_stored_analyses() {
        let db = Database::in_memory().unwrap();
        let first_client = Scripted::new(false);
        FailureAnalyzer::new(config(), first_client, ReportKind::Api)
            .analyze_report(&report(), Some(&db))
            .await
            .unwrap();

        let client = Scripted::new(false);
        let run = FailureAnalyzer::new(config(), client.clone(), ReportKind::Api)
            .analyze_report(&report(), Some(&db))
            .await
            .unwrap();

        assert_eq!(client.calls.load(Ordering::SeqCst), 0);
        assert_eq!(run.reused, 2);
        assert!(run.results.iter().all(|r| r.reused));

        let stats = db.get_stats().unwrap();
        assert_eq!(stats.run_count, 2);
        assert_eq!(stats.distinct_failures, 2);
        assert_eq!(stats.total_occurrences, 6);
    }

    #[tokio::test]
    async fn renamed_scenarios_fall_back_to_position() {
        let client = Scripted::new(true);
        let run = FailureAnalyzer::new(config(), client, ReportKind::Api)
            .analyze_report(&report(), None)
            .await
            .unwrap();

        let expected: Vec<String> = dedup_failures(CucumberParser::new().failures(&report()))
            .into_iter()
            .map(|u| u.fingerprint)
            .collect();
        let got: Vec<String> = run.results.iter().map(|r| r.fingerprint.clone()).collect();
        assert_eq!(got, expected);
    }

    #[tokio::test]
    async fn outline_rows_keep_their_own_fingerprints() {
        let doc = serde_json::json!([
            {"name": "Login", "elements": [
                {"name": "Sign in as <role>", "steps": [
                    {"keyword": "When", "name": "I submit", "result": {"status": "failed", "error_message": "AssertionError: expected 200"}}
                ]},
                {"name": "Sign in as <role>", "steps": [
                    {"keyword": "When", "name": "I submit", "result": {"status": "failed", "error_message": "TimeoutError: waited"}}
                ]}
            ]}
        ]);
        let features = parse_report(doc.to_string().as_bytes()).unwrap();
        let db = Database::in_memory().unwrap();

        let run = FailureAnalyzer::new(config(), Scripted::new(false), ReportKind::Api)
            .analyze_report(&features, Some(&db))
            .await
            .unwrap();

        assert_eq!(run.unique_failures, 2);
        assert_ne!(run.results[0].fingerprint, run.results[1].fingerprint);
        assert_eq!(db.get_stats().unwrap().distinct_failures, 2);

        let expected: Vec<String> = dedup_failures(CucumberParser::new().failures(&features))
            .into_iter()
            .map(|u| u.fingerprint)
            .collect();
        for result in &run.results {
            assert!(expected.contains(&result.fingerprint));
        }

        // both rows are known now, so nothing goes back to the model
        let client = Scripted::new(false);
        let again = FailureAnalyzer::new(config(), client.clone(), ReportKind::Api)
            .analyze_report(&features, Some(&db))
            .await
            .unwrap();
        assert_eq!(client.calls.load(Ordering::SeqCst), 0);
        assert_eq!(again.reused, 2);
    }

    #[test]
    fn analyses_prefer_the_failure_with_the_same_error() {
        let failure = |error: &str| StructuredFailure {
            error_message: error.to_string(),
            step_details: "I submit".to_string(),
            feature_name: "Login".to_string(),
            scenario_name: "Sign in".to_string(),
            ..Default::default()
        };
        let failures = vec![failure("AssertionError: expected 200"), failure("TimeoutError: waited 5000ms")];
        let analysis = |error: &str| FailureAnalysis {
            detailed_reason: String::new(),
            error_message: error.to_string(),
            squad_name: String::new(),
            possible_causes: Vec::new(),
            recommended_fixes: Vec::new(),
            feature_name: "Login".to_string(),
            scenario_name: "Sign in".to_string(),
            step_details: "I submit".to_string(),
            file_path: String::new(),
            line_number: String::new(),
            error_category: None,
        };

        // answered in reverse order
        let mut used = vec![false; 2];
        let first = claim_failure(&analysis("TimeoutError: waited 7000ms"), 0, &failures, &mut used).unwrap();
        assert_eq!(first.error_message, "TimeoutError: waited 5000ms");
        let second = claim_failure(&analysis("AssertionError: expected 200"), 1, &failures, &mut used).unwrap();
        assert_eq!(second.error_message, "AssertionError: expected 200");
        assert!(claim_failure(&analysis("anything"), 2, &failures, &mut used).is_none());
    }

    #[tokio::test]
    async fn clean_report_makes_no_requests() {
        let client = Scripted::new(false);
        let doc = br#"[{"name": "Green", "elements": [{"name": "ok", "steps": [{"name": "s", "result": {"status": "passed"}}]}]}]"#;
        let run = FailureAnalyzer::new(config(), client.clone(), ReportKind::Api)
            .analyze_report(&parse_report(doc).unwrap(), None)
            .await
            .unwrap();

        assert_eq!(run.total_failures, 0);
        assert!(run.results.is_empty());
        assert_eq!(client.calls.load(Ordering::SeqCst), 0);
    }
}
