// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Read-only dashboard for stored failure analyses

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Json, Response},
    routing::get,
    Router,
};
use minijinja::HtmlEscape;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::AppConfig;
use crate::db::{Database, DbStats, RunRecord, StoredAnalysis};
use crate::summary::{summarize, SummaryMetrics};
use crate::AnalyserError;

const DEFAULT_LIMIT: usize = 100;

/// Shared application state
pub struct AppState {
    pub db: Database,
    pub config: AppConfig,
}

/// Create the web application router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Pages
        .route("/", get(summary_page))
        .route("/summary", get(summary_page))
        .route("/details", get(details_page))
        // API endpoints
        .route("/api/results", get(api_get_results))
        .route("/api/summary-metrics", get(api_summary_metrics))
        .route("/api/runs", get(api_get_runs))
        .route("/api/stats", get(api_get_stats))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Database failures surface as a JSON 500
struct ApiError(AnalyserError);

impl From<AnalyserError> for ApiError {
    fn from(e: AnalyserError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        error!("Dashboard query failed: {}", self.0);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"message": format!("An error occurred: {}", self.0)})),
        )
            .into_response()
    }
}

#[derive(Deserialize, Default)]
struct ResultsQuery {
    limit: Option<usize>,
    run: Option<String>,
    q: Option<String>,
}

#[derive(Deserialize, Default)]
struct RunQuery {
    run: Option<String>,
}

#[derive(Deserialize, Default)]
struct LimitQuery {
    limit: Option<usize>,
}

/// Results of the selected run, or of the latest one
fn run_results(db: &Database, run: Option<&str>) -> crate::Result<Vec<StoredAnalysis>> {
    match run {
        Some(id) => db.get_run_results(id),
        None => db.get_latest_run_results(),
    }
}

// === Page Handlers ===

async fn summary_page(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RunQuery>,
) -> Result<Html<String>, ApiError> {
    let results = run_results(&state.db, query.run.as_deref())?;
    let stats = state.db.get_stats()?;
    let runs = state.db.get_runs(10)?;
    Ok(Html(render_summary(&summarize(&results), &stats, &runs)))
}

async fn details_page(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RunQuery>,
) -> Result<Html<String>, ApiError> {
    let results = run_results(&state.db, query.run.as_deref())?;
    Ok(Html(render_details(&results)))
}

// === API Handlers ===

async fn api_get_results(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ResultsQuery>,
) -> Result<Json<Vec<StoredAnalysis>>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT);
    let results = match (query.run.as_deref(), query.q.as_deref()) {
        (Some(run), _) => {
            let mut results = state.db.get_run_results(run)?;
            results.truncate(limit);
            results
        }
        (None, Some(q)) => state.db.search_results(q, limit)?,
        (None, None) => state.db.get_recent_results(limit)?,
    };
    Ok(Json(results))
}

async fn api_summary_metrics(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RunQuery>,
) -> Result<Json<SummaryMetrics>, ApiError> {
    let results = run_results(&state.db, query.run.as_deref())?;
    Ok(Json(summarize(&results)))
}

async fn api_get_runs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Vec<RunRecord>>, ApiError> {
    Ok(Json(state.db.get_runs(query.limit.unwrap_or(DEFAULT_LIMIT))?))
}

async fn api_get_stats(State(state): State<Arc<AppState>>) -> Result<Json<DbStats>, ApiError> {
    Ok(Json(state.db.get_stats()?))
}

// === Template Rendering ===

/// Escape text for HTML bodies and attributes
pub fn escape_html(text: &str) -> String {
    HtmlEscape(text).to_string()
}

fn base_template(title: &str, content: &str) -> String {
    format!(r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>{} - Regression Analyser</title>
    <style>
        :root {{
            --bg-primary: #1a1a2e;
            --bg-secondary: #16213e;
            --bg-card: #0f3460;
            --text-primary: #e8e8e8;
            --text-secondary: #a0a0a0;
            --accent: #e94560;
            --success: #00d9a5;
            --border: #2a2a4a;
        }}
        * {{ box-sizing: border-box; margin: 0; padding: 0; }}
        body {{
            font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif;
            background: var(--bg-primary);
            color: var(--text-primary);
            line-height: 1.6;
        }}
        .container {{ max-width: 1400px; margin: 0 auto; padding: 20px; }}
        nav {{
            background: var(--bg-secondary);
            padding: 15px 20px;
            display: flex;
            align-items: center;
            gap: 30px;
            border-bottom: 1px solid var(--border);
        }}
        nav .logo {{
            font-size: 1.5em;
            font-weight: bold;
            color: var(--accent);
            text-decoration: none;
        }}
        nav a {{ color: var(--text-secondary); text-decoration: none; }}
        nav a:hover {{ color: var(--text-primary); }}
        .card {{
            background: var(--bg-card);
            border-radius: 12px;
            padding: 20px;
            margin-bottom: 20px;
        }}
        .card h2 {{ margin-bottom: 15px; color: var(--accent); }}
        .stats-grid {{
            display: grid;
            grid-template-columns: repeat(auto-fit, minmax(200px, 1fr));
            gap: 20px;
            margin-bottom: 30px;
        }}
        .stat-card {{
            background: var(--bg-card);
            border-radius: 12px;
            padding: 20px;
            text-align: center;
        }}
        .stat-card .number {{ font-size: 2.5em; font-weight: bold; color: var(--accent); }}
        .stat-card .label {{ color: var(--text-secondary); font-size: 0.9em; }}
        table {{ width: 100%; border-collapse: collapse; }}
        th, td {{
            padding: 12px;
            text-align: left;
            vertical-align: top;
            border-bottom: 1px solid var(--border);
        }}
        th {{ color: var(--text-secondary); font-weight: 500; }}
        tr:hover {{ background: rgba(255,255,255,0.05); }}
        ul {{ padding-left: 18px; }}
        .category-badge {{
            display: inline-block;
            background: var(--bg-secondary);
            border: 1px solid var(--border);
            padding: 4px 10px;
            border-radius: 6px;
            font-size: 0.85em;
        }}
        .reused {{ color: var(--success); font-size: 0.8em; }}
        .empty {{ color: var(--text-secondary); }}
    </style>
</head>
<body>
    <nav>
        <a href="/" class="logo">Regression Analyser</a>
        <a href="/">Summary</a>
        <a href="/details">Details</a>
    </nav>
    <main class="container">
        {}
    </main>
</body>
</html>"#, escape_html(title), content)
}

fn count_rows<'a>(rows: impl Iterator<Item = (&'a str, usize)>) -> String {
    let html: String = rows
        .map(|(label, count)| format!("<tr><td>{}</td><td>{}</td></tr>", escape_html(label), count))
        .collect();
    if html.is_empty() {
        r#"<tr><td colspan="2" class="empty">No failures</td></tr>"#.to_string()
    } else {
        html
    }
}

fn render_summary(metrics: &SummaryMetrics, stats: &DbStats, runs: &[RunRecord]) -> String {
    let stats_html = format!(r#"
        <div class="stats-grid">
            <div class="stat-card"><div class="number">{}</div><div class="label">Runs</div></div>
            <div class="stat-card"><div class="number">{}</div><div class="label">Analyses</div></div>
            <div class="stat-card"><div class="number">{}</div><div class="label">Distinct Failures</div></div>
            <div class="stat-card"><div class="number">{}</div><div class="label">Occurrences</div></div>
        </div>
    "#, stats.run_count, stats.analysis_count, stats.distinct_failures, stats.total_occurrences);

    let features = count_rows(metrics.feature_failures.iter().map(|f| (f.feature.as_str(), f.failed)));
    let categories = count_rows(metrics.category_failures.iter().map(|c| (c.category.as_str(), c.count)));

    let steps: String = metrics.step_failures.iter()
        .map(|s| format!(
            "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>",
            escape_html(&s.step),
            s.count,
            s.affected_features,
            s.affected_files
        ))
        .collect();

    let errors: String = metrics.error_type_failures.iter()
        .map(|e| format!(
            "<tr><td>{}</td><td>{}</td><td>{}</td></tr>",
            escape_html(&e.error_type),
            e.count,
            e.affected_features
        ))
        .collect();

    let run_rows: String = runs.iter()
        .map(|r| format!(
            r#"<tr><td><a href="/details?run={}">{}</a></td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>"#,
            escape_html(&r.id),
            r.created_at.format("%Y-%m-%d %H:%M"),
            escape_html(&r.source),
            escape_html(&r.kind),
            r.total_failures,
            r.unique_failures,
            r.reused
        ))
        .collect();

    let content = format!(r#"
        <h1>Failure Summary</h1>
        {}
        <div style="display: grid; grid-template-columns: 1fr 1fr; gap: 20px;">
            <div class="card">
                <h2>Failures by Feature</h2>
                <table><tr><th>Feature</th><th>Failed</th></tr>{}</table>
            </div>
            <div class="card">
                <h2>Failures by Category</h2>
                <table><tr><th>Category</th><th>Count</th></tr>{}</table>
            </div>
        </div>
        <div class="card">
            <h2>Failing Steps</h2>
            <table><tr><th>Step</th><th>Count</th><th>Features</th><th>Files</th></tr>{}</table>
        </div>
        <div class="card">
            <h2>Error Types</h2>
            <table><tr><th>Error</th><th>Count</th><th>Features</th></tr>{}</table>
        </div>
        <div class="card">
            <h2>Recent Runs</h2>
            <table><tr><th>Date</th><th>Source</th><th>Kind</th><th>Failures</th><th>Distinct</th><th>Reused</th></tr>{}</table>
        </div>
    "#, stats_html, features, categories, steps, errors, run_rows);

    base_template("Summary", &content)
}

fn list_html(items: &[String]) -> String {
    let li: String = items.iter()
        .map(|i| format!("<li>{}</li>", escape_html(i)))
        .collect();
    format!("<ul>{}</ul>", li)
}

fn render_details(results: &[StoredAnalysis]) -> String {
    let rows: String = results.iter()
        .map(|r| {
            let a = &r.analysis;
            let location = if a.line_number.is_empty() {
                escape_html(&a.file_path)
            } else {
                format!("{}:{}", escape_html(&a.file_path), escape_html(&a.line_number))
            };
            format!(r#"
                <tr>
                    <td>{}<br><small>{}</small></td>
                    <td>{}<br><small>{}</small></td>
                    <td>{}{}</td>
                    <td>{}</td>
                    <td>{}</td>
                    <td><span class="category-badge">{}</span><br>x{}</td>
                </tr>
            "#,
                escape_html(&a.feature_name),
                escape_html(&a.scenario_name),
                escape_html(&a.step_details),
                location,
                escape_html(&a.error_message),
                if r.reused { r#"<br><span class="reused">reused</span>"# } else { "" },
                escape_html(&a.detailed_reason),
                list_html(&a.recommended_fixes),
                escape_html(a.error_category.as_deref().unwrap_or("Uncategorised")),
                r.occurrences,
            )
        })
        .collect();

    let content = if rows.is_empty() {
        r#"<h1>Details</h1><div class="card"><p class="empty">No analyses stored yet</p></div>"#.to_string()
    } else {
        format!(r#"
            <h1>Details</h1>
            <div class="card">
                <table>
                    <tr>
                        <th>Feature / Scenario</th>
                        <th>Step / Location</th>
                        <th>Error</th>
                        <th>Root Cause</th>
                        <th>Recommended Fixes</th>
                        <th>Category</th>
                    </tr>
                    {}
                </table>
            </div>
        "#, rows)
    };

    base_template("Details", &content)
}

/// Start the web server with config and database
pub async fn start_server(config: AppConfig, db: Database) -> crate::Result<()> {
    let state = Arc::new(AppState {
        db,
        config: config.clone(),
    });

    let addr = format!("{}:{}", config.web.host, config.web.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!("Dashboard available at http://{}", addr);

    let router = create_router(state);
    axum::serve(listener, router).await
        .map_err(|e| AnalyserError::Config(format!("Server error: {}", e)))?;

    Ok(())
}
