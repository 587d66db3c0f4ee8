// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Error types for the regression analyser

use thiserror::Error;

/// Result type alias for analyser operations
pub type Result<T> = std::result::Result<T, AnalyserError>;

/// Analyser error types
#[derive(Error, Debug)]
pub enum AnalyserError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("File system error: {0}")]
    FileSystem(#[from] std::io::Error),

    #[error("API error: {0}")]
    Api(#[from] reqwest::Error),

    #[error("LLM not available: {0}")]
    LlmUnavailable(String),

    #[error("LLM rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Invalid report: {0}")]
    Report(String),

    #[error("Could not parse LLM output as JSON. Output was:\n{text}\nError: {reason}")]
    OutputParse { text: String, reason: String },

    #[error("Template error: {0}")]
    Template(#[from] minijinja::Error),

    #[error("Analysis error: {0}")]
    Analysis(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
