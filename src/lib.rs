// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Regression Analyser: LLM root-cause analysis for Cucumber reports
//!
//! Failing scenarios are pulled out of Cucumber JSON reports, batched into
//! prompts, explained by a language model, deduplicated across runs and
//! stored for the dashboard.

pub mod analyzer;
pub mod chain;
pub mod config;
pub mod db;
pub mod dedup;
pub mod error;
pub mod llm;
pub mod output;
pub mod prompt;
pub mod report;
pub mod summary;
pub mod web;

pub use config::AppConfig;
pub use error::{AnalyserError, Result};
