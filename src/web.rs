use crate::{
    csv_io,
    grouping::{BatchResult, CancelToken, Engine, GroupingError, Progress, SubmitRequest},
    keywords::{KeywordQuery, KeywordRow, Page},
    prompts::PromptTemplate,
    taxonomy::CategoryNode,
};
use anyhow::Context;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tokio::signal;

#[derive(Clone)]
struct SharedState {
    engine: Arc<Engine>,
    /// Cancelled on shutdown so running batches stop issuing chunks
    cancel: CancelToken,
}

pub fn router(engine: Arc<Engine>, cancel: CancelToken) -> Router {
    let shared_state = Arc::new(SharedState { engine, cancel });

    Router::new()
        .route("/api/submit", post(submit))
        .route("/api/query", post(query))
        .route("/api/export", get(export))
        .route("/api/taxonomy", get(taxonomy))
        .route("/api/prompts", get(prompts))
        .layer(
            tower_http::trace::TraceLayer::new_for_http()
                .make_span_with(tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO))
                .on_response(tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO)),
        )
        .with_state(shared_state)
}

async fn start_app(engine: Arc<Engine>, addr: &str) -> anyhow::Result<()> {
    let cancel = CancelToken::new();
    let app = router(engine, cancel.clone());

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    log::info!("listening on {addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel))
        .await
        .context("server error")?;
    log::info!("daemon stopped");
    Ok(())
}

async fn shutdown_signal(cancel: CancelToken) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            log::error!("failed to install ctrl-c handler: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                log::error!("failed to install SIGTERM handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    log::warn!("shutting down, waiting for running batches");
    cancel.cancel();
}

pub fn start_daemon(engine: Arc<Engine>, addr: &str) -> anyhow::Result<()> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?
        .block_on(start_app(engine, addr))
}

#[derive(Debug)]
struct HttpError(GroupingError);

impl IntoResponse for HttpError {
    fn into_response(self) -> axum::response::Response {
        if !self.0.is_fatal() {
            log::error!("{self:?}");
        }
        let status = match self.0 {
            GroupingError::InputValidation(_) => StatusCode::BAD_REQUEST,
            GroupingError::ProviderAuth { .. } => StatusCode::UNAUTHORIZED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (
            status,
            [(header::CONTENT_TYPE, "application/json")],
            json!({"error": self.0.to_string()}).to_string(),
        )
            .into_response()
    }
}

impl<E> From<E> for HttpError
where
    E: Into<GroupingError>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

async fn submit(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<SubmitRequest>,
) -> Result<Json<BatchResult>, HttpError> {
    log::debug!("payload: {payload:?}");

    tokio::task::block_in_place(move || {
        let no_progress = |_: Progress| {};
        state
            .engine
            .submit(payload, &state.cancel, &no_progress)
            .map(Json)
            .map_err(Into::into)
    })
}

async fn query(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<KeywordQuery>,
) -> Result<Json<Page<KeywordRow>>, HttpError> {
    tokio::task::block_in_place(move || state.engine.query(&payload).map(Json).map_err(Into::into))
}

async fn export(State(state): State<Arc<SharedState>>) -> Result<impl IntoResponse, HttpError> {
    let body = tokio::task::block_in_place(move || -> Result<String, HttpError> {
        let rows = state.engine.snapshot()?;
        csv_io::export_to_string(&rows).map_err(|err| GroupingError::persistence(err).into())
    })?;

    Ok((
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8"),
            (header::CONTENT_DISPOSITION, "attachment; filename=\"keywords.csv\""),
        ],
        body,
    ))
}

#[derive(Debug, Serialize)]
struct TaxonomyResponse {
    outline: String,
    digest: String,
    nodes: Vec<CategoryNode>,
}

async fn taxonomy(State(state): State<Arc<SharedState>>) -> Json<TaxonomyResponse> {
    let tree = state.engine.taxonomy();
    Json(TaxonomyResponse {
        outline: tree.outline(),
        digest: state.engine.digest(),
        nodes: tree.nodes().to_vec(),
    })
}

async fn prompts(State(state): State<Arc<SharedState>>) -> Result<Json<Vec<PromptTemplate>>, HttpError> {
    state
        .engine
        .prompts()
        .list()
        .map(Json)
        .map_err(|err| GroupingError::persistence(err).into())
}
