//! Axum + Askama HTTP surface for catalog ingestion.

use std::net::SocketAddr;
use std::sync::Arc;

use askama::Template;
use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Query, State,
    },
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use merchant_core::{Offer, OfferId, OfferQuery, SellerId, TaskId, TaskLog};
use merchant_storage::{OfferStore, StoreError};
use merchant_sync::{IngestPipeline, IngestRequest, PipelineError, RunMode, Submission, TaskError};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{error, info};

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<IngestPipeline>,
    pub store: Arc<dyn OfferStore>,
}

impl AppState {
    pub fn new(pipeline: Arc<IngestPipeline>) -> Self {
        let store = Arc::clone(pipeline.store());
        Self { pipeline, store }
    }
}

/// Errors returned by handlers, rendered as `{"error": "..."}`.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(&'static str),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::InvalidRequest(msg) => ApiError::BadRequest(msg),
            PipelineError::Store(err) => ApiError::Store(err),
            PipelineError::Task(err) => ApiError::Internal(err.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m.clone()),
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, (*m).to_owned()),
            ApiError::Store(e) => {
                error!(error = %e, "store error");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal server error".to_owned())
            }
            ApiError::Internal(m) => {
                error!(message = %m, "internal server error");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal server error".to_owned())
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct SubmitBody {
    pub url: String,
    pub seller_id: SellerId,
    #[serde(rename = "async", default)]
    pub detached: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct OffersParams {
    pub offer_id: Option<OfferId>,
    pub seller_id: Option<SellerId>,
    pub name_search: Option<String>,
}

impl OffersParams {
    /// Zero and empty values mean "no filter".
    fn into_query(self) -> OfferQuery {
        OfferQuery {
            offer_id: self.offer_id.filter(|id| *id != 0),
            seller_id: self.seller_id.filter(|id| *id != 0),
            name_contains: self.name_search.filter(|s| !s.is_empty()),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct InfoParams {
    pub task_id: TaskId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskLogBody {
    pub task_id: TaskId,
    pub url: String,
    pub seller_id: SellerId,
    pub status: String,
    pub elapsed_time: String,
    pub lines_parsed: u64,
    pub new_offers: u64,
    pub updated_offers: u64,
    pub errors: u64,
}

impl From<TaskLog> for TaskLogBody {
    fn from(log: TaskLog) -> Self {
        Self {
            task_id: log.task_id,
            status: log.status.to_string(),
            elapsed_time: log.elapsed.map(|d| format!("{d:?}")).unwrap_or_default(),
            lines_parsed: log.counters.lines_parsed,
            new_offers: log.counters.new_offers,
            updated_offers: log.counters.updated_offers,
            errors: log.counters.errors,
            url: log.url,
            seller_id: log.seller_id,
        }
    }
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    version: &'static str,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/offers", get(find_offers_handler).post(submit_handler))
        .route("/info", get(info_handler))
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "http server listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn index_handler() -> Response {
    match (IndexTemplate {
        version: env!("CARGO_PKG_VERSION"),
    })
    .render()
    {
        Ok(html) => Html(html).into_response(),
        Err(err) => ApiError::Internal(err.to_string()).into_response(),
    }
}

async fn submit_handler(
    State(state): State<AppState>,
    body: Result<Json<SubmitBody>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(body) = body.map_err(|rejection| ApiError::BadRequest(rejection.body_text()))?;
    let request = IngestRequest {
        url: body.url,
        seller_id: body.seller_id,
        mode: if body.detached {
            RunMode::Detached
        } else {
            RunMode::Inline
        },
    };
    match state.pipeline.submit(request).await? {
        Submission::Accepted(task_id) => {
            Ok((StatusCode::ACCEPTED, Json(json!({ "task_id": task_id }))).into_response())
        }
        Submission::Completed(log) => Ok(Json(TaskLogBody::from(log)).into_response()),
    }
}

async fn find_offers_handler(
    State(state): State<AppState>,
    params: Result<Query<OffersParams>, QueryRejection>,
) -> Result<Json<Vec<Offer>>, ApiError> {
    let Query(params) = params.map_err(|rejection| ApiError::BadRequest(rejection.body_text()))?;
    let offers = state.store.find_offers(&params.into_query()).await?;
    if offers.is_empty() {
        return Err(ApiError::NotFound("No match"));
    }
    Ok(Json(offers))
}

async fn info_handler(
    State(state): State<AppState>,
    params: Result<Query<InfoParams>, QueryRejection>,
) -> Result<Json<TaskLogBody>, ApiError> {
    let Ok(Query(params)) = params else {
        return Err(ApiError::NotFound("incorrect task_id"));
    };
    match state.pipeline.tracker().poll(params.task_id).await {
        Ok(log) => Ok(Json(log.into())),
        Err(TaskError::NotFound(_)) => Err(ApiError::NotFound("incorrect task_id")),
        Err(TaskError::Store(err)) => Err(err.into()),
        Err(err) => Err(ApiError::Internal(err.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use merchant_adapters::{CsvReader, RecordParser};
    use merchant_storage::{FetchError, MemoryOfferStore, SourceFetcher};
    use tower::ServiceExt;

    const CATALOG: &str = "\
offer_id,name,price,quantity,available
1,Blue Widget,9.99,5,true
2,Red Gadget,3.50,0,false
oops,Broken,1,1,true
";

    struct StaticFetcher;

    #[async_trait]
    impl SourceFetcher for StaticFetcher {
        async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
            if url.ends_with("missing.csv") {
                return Err(FetchError::HttpStatus {
                    status: 404,
                    url: url.to_string(),
                });
            }
            Ok(CATALOG.as_bytes().to_vec())
        }
    }

    fn test_app() -> Router {
        let store = Arc::new(MemoryOfferStore::new());
        let pipeline = Arc::new(IngestPipeline::new(
            store,
            Arc::new(StaticFetcher),
            Arc::new(CsvReader),
            RecordParser::default(),
        ));
        app(AppState::new(pipeline))
    }

    fn post_offers(body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/offers")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn json_body(resp: Response) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn handler_smoke_get_index() {
        let resp = test_app().oneshot(get("/")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("Merchant Catalog Ingest"));
    }

    #[tokio::test]
    async fn inline_submit_returns_the_task_log() {
        let resp = test_app()
            .oneshot(post_offers(json!({"url": "http://example.test/catalog.csv", "seller_id": 3})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let log: TaskLogBody = serde_json::from_value(json_body(resp).await).unwrap();
        assert_eq!(log.task_id, 1);
        assert_eq!(log.status, "Finished");
        assert_eq!((log.lines_parsed, log.new_offers, log.updated_offers, log.errors), (2, 2, 0, 1));
        assert!(!log.elapsed_time.is_empty());
    }

    #[tokio::test]
    async fn async_submit_returns_task_id_then_info_resolves() {
        let app = test_app();
        let resp = app
            .clone()
            .oneshot(post_offers(json!({
                "url": "http://example.test/catalog.csv",
                "seller_id": 3,
                "async": true
            })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert_eq!(json_body(resp).await, json!({"task_id": 1}));

        let mut finished = None;
        for _ in 0..200 {
            let resp = app.clone().oneshot(get("/info?task_id=1")).await.unwrap();
            if resp.status() == StatusCode::OK {
                finished = Some(json_body(resp).await);
                break;
            }
            assert_eq!(resp.status(), StatusCode::NOT_FOUND);
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let finished = finished.expect("task reaches a terminal state");
        assert_eq!(finished["status"], "Finished");
        assert_eq!(finished["new_offers"], 2);
    }

    #[tokio::test]
    async fn failed_fetch_is_reported_in_the_task_log() {
        let resp = test_app()
            .oneshot(post_offers(json!({"url": "http://example.test/missing.csv", "seller_id": 3})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert!(body["status"]
            .as_str()
            .unwrap()
            .starts_with("Error: cannot load file"));
        assert_eq!(body["lines_parsed"], 0);
        assert_eq!(body["errors"], 0);
    }

    #[tokio::test]
    async fn invalid_submit_is_a_bad_request() {
        let resp = test_app()
            .oneshot(post_offers(json!({"url": "", "seller_id": 3})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(resp).await, json!({"error": "url is required"}));
    }

    #[tokio::test]
    async fn offers_search_filters_and_reports_no_match() {
        let app = test_app();
        app.clone()
            .oneshot(post_offers(json!({"url": "http://example.test/catalog.csv", "seller_id": 3})))
            .await
            .unwrap();

        let resp = app
            .clone()
            .oneshot(get("/offers?seller_id=3&name_search=Widget"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let offers = json_body(resp).await;
        assert_eq!(offers.as_array().unwrap().len(), 1);
        assert_eq!(offers[0]["offer_id"], 1);
        assert_eq!(offers[0]["price"], 9.99);

        let all = app.clone().oneshot(get("/offers")).await.unwrap();
        assert_eq!(json_body(all).await.as_array().unwrap().len(), 2);

        let none = app.oneshot(get("/offers?seller_id=4")).await.unwrap();
        assert_eq!(none.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(none).await, json!({"error": "No match"}));
    }

    #[tokio::test]
    async fn malformed_requests_keep_the_json_error_shape() {
        let app = test_app();
        for uri in ["/info?task_id=abc", "/info"] {
            let resp = app.clone().oneshot(get(uri)).await.unwrap();
            assert_eq!(resp.status(), StatusCode::NOT_FOUND);
            assert_eq!(json_body(resp).await, json!({"error": "incorrect task_id"}));
        }

        let resp = app.clone().oneshot(get("/offers?seller_id=three")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(json_body(resp).await["error"].is_string());

        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/offers")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from("{\"url\": 5"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(json_body(resp).await["error"].is_string());
    }

    #[tokio::test]
    async fn info_for_unknown_task_is_not_found() {
        let resp = test_app().oneshot(get("/info?task_id=42")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(resp).await, json!({"error": "incorrect task_id"}));
    }
}
