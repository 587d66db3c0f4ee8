// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Batching and dispatch of failure analysis requests
//!
//! UI failures go out one per request with their screenshot attached. API
//! failures are packed into requests bounded by character count and item
//! count. Either way requests are sent in parallel groups of `batch_size`,
//! with a pause between groups to stay under provider rate limits.

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::llm::{LlmClient, LlmMessage};
use crate::output::{parse_analyses, FailureAnalysis};
use crate::prompt::{format_instructions, PromptTemplate};
use crate::report::StructuredFailure;
use crate::{AnalyserError, Result};

/// How failures are packed into requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainMode {
    /// Several failures per request, no screenshots
    Api,
    /// One failure per request with its screenshot
    Ui,
}

impl fmt::Display for ChainMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainMode::Api => f.write_str("api"),
            ChainMode::Ui => f.write_str("ui"),
        }
    }
}

impl FromStr for ChainMode {
    type Err = AnalyserError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "api" => Ok(ChainMode::Api),
            "ui" => Ok(ChainMode::Ui),
            other => Err(AnalyserError::Config(format!("Unknown report kind '{}', expected api or ui", other))),
        }
    }
}

/// Items grouped into requests, plus the ones too large to send
#[derive(Debug, Clone, PartialEq)]
pub struct Batches<T> {
    pub batches: Vec<Vec<T>>,
    pub dropped: Vec<T>,
}

/// Greedily pack items into batches in input order.
///
/// A new batch starts when adding the next item would exceed `max_chars` or
/// the current batch already holds `max_items`. Items larger than
/// `max_chars` on their own are dropped. Every input item ends up in
/// exactly one batch or in `dropped`.
pub fn create_batches<T, F>(items: Vec<T>, size_of: F, max_chars: usize, max_items: usize) -> Batches<T>
where
    F: Fn(&T) -> usize,
{
    let total = items.len();
    let max_items = max_items.max(1);
    let mut batches = Vec::new();
    let mut dropped = Vec::new();
    let mut current: Vec<T> = Vec::new();
    let mut current_chars = 0usize;

    for (idx, item) in items.into_iter().enumerate() {
        let item_chars = size_of(&item);

        if item_chars > max_chars {
            warn!("Item at index {} exceeds max_chars ({}) and will be dropped", idx, max_chars);
            dropped.push(item);
            continue;
        }

        if !current.is_empty()
            && (current_chars + item_chars > max_chars || current.len() >= max_items)
        {
            batches.push(std::mem::take(&mut current));
            current_chars = 0;
        }

        current.push(item);
        current_chars += item_chars;
    }

    if !current.is_empty() {
        batches.push(current);
    }

    if !dropped.is_empty() {
        warn!("Dropped {} items due to exceeding max_chars", dropped.len());
    }

    let batched: usize = batches.iter().map(Vec::len).sum();
    if batched + dropped.len() != total {
        error!("Batching lost {} items", total - batched - dropped.len());
    }

    Batches { batches, dropped }
}

/// A request that came back with parseable analyses
#[derive(Debug, Clone)]
pub struct CompletedRequest {
    pub failures: Vec<StructuredFailure>,
    pub analyses: Vec<FailureAnalysis>,
}

/// A request that failed after retries
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestError {
    /// `feature / scenario` labels of the failures in the request
    pub scenarios: Vec<String>,
    pub message: String,
}

/// Everything a chain run produced
#[derive(Debug, Clone, Default)]
pub struct ChainOutcome {
    pub completed: Vec<CompletedRequest>,
    pub errors: Vec<RequestError>,
    /// Failures never sent because they exceeded the character budget
    pub dropped: Vec<StructuredFailure>,
}

impl ChainOutcome {
    /// All analyses in request order
    pub fn analyses(&self) -> Vec<FailureAnalysis> {
        self.completed.iter().flat_map(|r| r.analyses.iter().cloned()).collect()
    }
}

/// Prompt-build, call and parse pipeline over a set of failures
pub struct FailureChain {
    client: Arc<dyn LlmClient>,
    template: PromptTemplate,
    format_instructions: String,
    mode: ChainMode,
    batch_size: usize,
    max_items_per_request: usize,
    max_chars: usize,
    delay_between_batches: Duration,
}

impl FailureChain {
    pub fn new(client: Arc<dyn LlmClient>, template: PromptTemplate, mode: ChainMode) -> Self {
        Self {
            client,
            template,
            format_instructions: format_instructions(),
            mode,
            batch_size: 25,
            max_items_per_request: 5,
            max_chars: 200_000,
            delay_between_batches: Duration::from_secs(60),
        }
    }

    /// Build a chain from the batching and prompt sections of the config
    pub fn from_config(client: Arc<dyn LlmClient>, config: &AppConfig, mode: ChainMode) -> Result<Self> {
        let source = match mode {
            ChainMode::Api => &config.prompts.api,
            ChainMode::Ui => &config.prompts.ui,
        };
        let batching = &config.batching;

        Ok(Self::new(client, PromptTemplate::new(source.as_str())?, mode)
            .with_batch_size(batching.batch_size)
            .with_max_items_per_request(batching.max_items_per_request)
            .with_max_chars(batching.max_chars)
            .with_delay(Duration::from_secs(batching.delay_between_batches_secs)))
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_max_items_per_request(mut self, max_items: usize) -> Self {
        self.max_items_per_request = max_items.max(1);
        self
    }

    pub fn with_max_chars(mut self, max_chars: usize) -> Self {
        self.max_chars = max_chars;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay_between_batches = delay;
        self
    }

    pub fn mode(&self) -> ChainMode {
        self.mode
    }

    /// Build the message for one request
    pub fn prepare_input(&self, failures: &[StructuredFailure]) -> Result<LlmMessage> {
        match self.mode {
            ChainMode::Ui => {
                let failure = failures
                    .first()
                    .ok_or_else(|| AnalyserError::Analysis("UI request without a failure".to_string()))?;
                let text = self
                    .template
                    .render(std::slice::from_ref(&failure.without_screenshot()), &self.format_instructions)?;
                let message = LlmMessage::text(text);
                Ok(if failure.screenshot.is_empty() {
                    message
                } else {
                    message.with_image(failure.screenshot.clone())
                })
            }
            ChainMode::Api => {
                let stripped: Vec<StructuredFailure> = failures.iter().map(|f| f.without_screenshot()).collect();
                let text = self.template.render(&stripped, &self.format_instructions)?;
                Ok(LlmMessage::text(text))
            }
        }
    }

    async fn invoke(&self, failures: &[StructuredFailure]) -> Result<Vec<FailureAnalysis>> {
        let message = self.prepare_input(failures)?;
        let text = self.client.generate(&message).await?;
        parse_analyses(&text)
    }

    /// Analyse one failure in its own request
    pub async fn process_single(&self, failure: &StructuredFailure) -> Result<Vec<FailureAnalysis>> {
        self.invoke(std::slice::from_ref(failure)).await
    }

    /// One request per failure, dispatched in parallel groups of `batch_size`
    pub async fn process_batch(&self, failures: Vec<StructuredFailure>) -> ChainOutcome {
        let requests = failures.into_iter().map(|f| vec![f]).collect();
        self.dispatch(requests, "batch").await
    }

    /// Pack failures into size-bounded requests, then dispatch those in groups
    pub async fn process_batched_items(&self, failures: Vec<StructuredFailure>) -> ChainOutcome {
        let stripped: Vec<StructuredFailure> = failures.iter().map(|f| f.without_screenshot()).collect();
        let batches = create_batches(
            stripped,
            StructuredFailure::prompt_len,
            self.max_chars,
            self.max_items_per_request,
        );

        let mut outcome = self.dispatch(batches.batches, "batch group").await;
        outcome.dropped = batches.dropped;
        outcome
    }

    /// Run the strategy matching the chain's mode
    pub async fn run(&self, failures: Vec<StructuredFailure>) -> ChainOutcome {
        match self.mode {
            ChainMode::Ui => self.process_batch(failures).await,
            ChainMode::Api => self.process_batched_items(failures).await,
        }
    }

    async fn dispatch(&self, requests: Vec<Vec<StructuredFailure>>, label: &str) -> ChainOutcome {
        let start = Instant::now();
        let mut outcome = ChainOutcome::default();
        let num_groups = requests.len().div_ceil(self.batch_size);

        for (group_idx, group) in requests.chunks(self.batch_size).enumerate() {
            let group_num = group_idx + 1;
            info!(
                "Processing {} {}/{} with {} requests via {} ({})",
                label,
                group_num,
                num_groups,
                group.len(),
                self.client.name(),
                self.client.model()
            );

            let results = join_all(group.iter().map(|failures| self.invoke(failures))).await;

            for (failures, result) in group.iter().zip(results) {
                match result {
                    Ok(analyses) => {
                        debug!("Request for {} failures returned {} analyses", failures.len(), analyses.len());
                        outcome.completed.push(CompletedRequest {
                            failures: failures.clone(),
                            analyses,
                        });
                    }
                    Err(e) => {
                        error!("Analysis request failed: {}", e);
                        outcome.errors.push(RequestError {
                            scenarios: failures
                                .iter()
                                .map(|f| format!("{} / {}", f.feature_name, f.scenario_name))
                                .collect(),
                            message: e.to_string(),
                        });
                    }
                }
            }

            if group_num < num_groups && !self.delay_between_batches.is_zero() {
                info!(
                    "{} {} finished. Waiting for {:?}",
                    label, group_num, self.delay_between_batches
                );
                tokio::time::sleep(self.delay_between_batches).await;
            }
        }

        info!("Processing completed in {:.2} seconds", start.elapsed().as_secs_f64());
        outcome
    }
}
