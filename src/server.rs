//! Read-only JSON HTTP API over the knowledge base.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `GET`  | `/opportunities` | Search; query params `q`, `category`, `min_severity`, `min_frequency`, `status`, `since`, `until`, `limit` |
//! | `GET`  | `/opportunities/{id}` | One opportunity with its provenance |
//! | `GET`  | `/stats` | Knowledge base summary |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "opportunity not found: 42" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `conflict` (409,
//! writer lock busy), `internal` (500).

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use feedback_harness_core::error::ErrorKind;
use feedback_harness_core::models::{Category, Severity, Status};
use feedback_harness_core::search::{SearchHit, SearchQuery};
use feedback_harness_core::store::{parse_time_bound, OpportunityFilter, Store};
use feedback_harness_core::summary::KbSummary;
use feedback_harness_core::KbError;

use crate::config::Config;
use crate::get::OpportunityDetail;
use crate::kb::KnowledgeBase;

/// Serve the API on `[server].bind` until the process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let kb = Arc::new(KnowledgeBase::open(config).await?);
    let app = router(kb);

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    tracing::info!(bind = %config.server.bind, "http server started");
    println!("Feedback API listening on http://{}", config.server.bind);

    axum::serve(listener, app).await?;
    Ok(())
}

/// Build the router over any store backend.
pub fn router<S: Store + 'static>(kb: Arc<KnowledgeBase<S>>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/opportunities", get(handle_search::<S>))
        .route("/opportunities/{id}", get(handle_get::<S>))
        .route("/stats", get(handle_stats::<S>))
        .layer(cors)
        .with_state(kb)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<KbError> for AppError {
    fn from(err: KbError) -> Self {
        let (status, code) = match err.kind() {
            ErrorKind::Validation => (StatusCode::BAD_REQUEST, "bad_request"),
            ErrorKind::NotFound => (StatusCode::NOT_FOUND, "not_found"),
            ErrorKind::Concurrency => (StatusCode::CONFLICT, "conflict"),
            ErrorKind::Persistence => {
                tracing::error!(error = %err, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal")
            }
        };
        AppError {
            status,
            code,
            message: err.to_string(),
        }
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

// ============ GET /opportunities ============

/// Raw query parameters; parsed by hand so bad values get the JSON error body.
#[derive(Debug, Default, Deserialize)]
struct SearchParams {
    #[serde(default)]
    q: String,
    category: Option<String>,
    min_severity: Option<String>,
    min_frequency: Option<String>,
    status: Option<String>,
    since: Option<String>,
    until: Option<String>,
    limit: Option<String>,
}

impl SearchParams {
    fn filter(&self) -> Result<OpportunityFilter, KbError> {
        Ok(OpportunityFilter {
            category: self.category.as_deref().map(str::parse::<Category>).transpose()?,
            min_severity: self
                .min_severity
                .as_deref()
                .map(str::parse::<Severity>)
                .transpose()?,
            min_frequency: parse_number("min_frequency", self.min_frequency.as_deref())?,
            status: self.status.as_deref().map(str::parse::<Status>).transpose()?,
            since: self
                .since
                .as_deref()
                .map(|v| parse_time_bound(v, false))
                .transpose()?,
            until: self
                .until
                .as_deref()
                .map(|v| parse_time_bound(v, true))
                .transpose()?,
        })
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, value: Option<&str>) -> Result<Option<T>, KbError> {
    value
        .map(|v| {
            v.parse()
                .map_err(|_| KbError::Validation(format!("{} must be a non-negative integer, got '{}'", name, v)))
        })
        .transpose()
}

async fn handle_search<S: Store + 'static>(
    State(kb): State<Arc<KnowledgeBase<S>>>,
    Query(params): Query<SearchParams>,
) -> Result<Json<Vec<SearchHit>>, AppError> {
    let query = SearchQuery {
        text: &params.q,
        filter: params.filter()?,
        limit: parse_number("limit", params.limit.as_deref())?,
    };
    Ok(Json(kb.search(&query).await?))
}

// ============ GET /opportunities/{id} ============

async fn handle_get<S: Store + 'static>(
    State(kb): State<Arc<KnowledgeBase<S>>>,
    Path(id): Path<String>,
) -> Result<Json<OpportunityDetail>, AppError> {
    let opportunity = kb.get_by_id(&id).await?;
    let provenance = kb.provenance(&id).await?;
    Ok(Json(OpportunityDetail {
        opportunity,
        provenance,
    }))
}

// ============ GET /stats ============

async fn handle_stats<S: Store + 'static>(
    State(kb): State<Arc<KnowledgeBase<S>>>,
) -> Result<Json<KbSummary>, AppError> {
    Ok(Json(kb.summary().await?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_search_params_parse_filters() {
        let params = SearchParams {
            category: Some("pain_point".into()),
            min_severity: Some("high".into()),
            min_frequency: Some("2".into()),
            ..Default::default()
        };
        let filter = params.filter().unwrap();
        assert_eq!(filter.category, Some(Category::PainPoint));
        assert_eq!(filter.min_severity, Some(Severity::High));
        assert_eq!(filter.min_frequency, Some(2));
    }

    #[test]
    fn test_bad_params_are_validation_errors() {
        let params = SearchParams {
            min_severity: Some("urgent".into()),
            ..Default::default()
        };
        assert!(matches!(params.filter(), Err(KbError::InvalidSeverity(_))));

        let params = SearchParams {
            min_frequency: Some("-1".into()),
            ..Default::default()
        };
        assert!(params.filter().unwrap_err().is_validation());

        let params = SearchParams {
            since: Some("last tuesday".into()),
            ..Default::default()
        };
        assert!(params.filter().unwrap_err().is_validation());
    }

    #[test]
    fn test_date_params_cover_whole_days() {
        let params = SearchParams {
            since: Some("2024-05-01".into()),
            until: Some("2024-05-31".into()),
            ..Default::default()
        };
        let filter = params.filter().unwrap();
        assert_eq!(
            filter.since.unwrap().to_rfc3339(),
            "2024-05-01T00:00:00+00:00"
        );
        assert_eq!(
            filter.until.unwrap().to_rfc3339(),
            "2024-05-31T23:59:59.999+00:00"
        );
    }

    #[test]
    fn test_error_mapping() {
        let e = AppError::from(KbError::NotFound("x".into()));
        assert_eq!(e.status, StatusCode::NOT_FOUND);
        assert_eq!(e.code, "not_found");

        let e = AppError::from(KbError::LockTimeout(std::time::Duration::from_secs(1)));
        assert_eq!(e.status, StatusCode::CONFLICT);

        let e = AppError::from(KbError::EmptyEmbedding);
        assert_eq!(e.code, "bad_request");
    }
}
