use std::{net::SocketAddr, sync::Arc};

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap, HeaderValue, Method, Request, StatusCode, Uri},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::trace::{self, TraceLayer};
use tracing::Level;

use crate::{
    api::{self, Api},
    params::Params,
    response::{respond, respond_error, ErrorKind},
};

const CORS_HEADERS: [(&str, &str); 4] = [
    (
        "access-control-allow-headers",
        "Accept, Authorization, Content-Type, Origin",
    ),
    ("access-control-allow-methods", "GET, OPTIONS"),
    ("access-control-allow-origin", "*"),
    ("access-control-expose-headers", "Date"),
];

/// Builds the API router mounted under `prefix`.
pub fn router(api: Arc<Api>, prefix: &str) -> Router {
    let routes = Router::new()
        .route("/query", get(query).post(query))
        .route("/query_range", get(query_range).post(query_range))
        .route("/series", get(series).post(series))
        .route("/labels", get(label_names).post(label_names))
        .route("/labels/:name/values", get(label_values))
        .route("/label/:name/values", get(label_values))
        .with_state(api);
    let prefix = prefix.trim_end_matches('/');
    let app = if prefix.is_empty() {
        routes
    } else {
        Router::new().nest(prefix, routes)
    };
    app.fallback(not_found)
        .layer(middleware::from_fn(cors))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(trace::DefaultMakeSpan::new().level(Level::INFO))
                .on_response(trace::DefaultOnResponse::new().level(Level::INFO)),
        )
}

pub async fn serve(addr: SocketAddr, app: Router) -> color_eyre::Result<()> {
    tracing::info!("start http server: {:?}", addr);
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(%error, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}

/// Answers `OPTIONS` on any path with 204 and adds the CORS headers to every
/// other response.
async fn cors<B>(req: Request<B>, next: Next<B>) -> Response {
    let mut response = if req.method() == Method::OPTIONS {
        StatusCode::NO_CONTENT.into_response()
    } else {
        next.run(req).await
    };
    let headers = response.headers_mut();
    for (name, value) in CORS_HEADERS {
        headers.insert(name, HeaderValue::from_static(value));
    }
    response
}

async fn not_found(uri: Uri) -> Response {
    let mut response =
        respond_error::<()>(ErrorKind::BadData, &format!("path {} not found", uri.path()), None);
    *response.status_mut() = StatusCode::NOT_FOUND;
    response
}

/// Request parameters from the query string and, for form posts, the body.
fn request_params(uri: &Uri, headers: &HeaderMap, body: &Bytes) -> Params {
    let is_form = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map_or(false, |ct| {
            ct.starts_with("application/x-www-form-urlencoded")
        });
    Params::parse(uri.query(), is_form.then_some(body.as_ref()))
}

fn into_response<T: Serialize>(result: api::Result<T>) -> Response {
    match result {
        Ok(data) => respond(data),
        Err(e) => {
            if e.kind == ErrorKind::Internal {
                tracing::error!(error = %e.message, "request failed");
            } else {
                tracing::debug!(error_type = %e.kind, error = %e.message, "request failed");
            }
            e.into_response()
        }
    }
}

async fn query(
    State(api): State<Arc<Api>>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    // dropping the request cancels whatever it still runs
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();
    let params = request_params(&uri, &headers, &body);
    into_response(api.query(&params, &cancel).await)
}

async fn query_range(
    State(api): State<Arc<Api>>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();
    let params = request_params(&uri, &headers, &body);
    into_response(api.query_range(&params, &cancel).await)
}

async fn series(
    State(api): State<Arc<Api>>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();
    let params = request_params(&uri, &headers, &body);
    into_response(api.series(&params, &cancel).await)
}

async fn label_names(
    State(api): State<Arc<Api>>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();
    let params = request_params(&uri, &headers, &body);
    into_response(api.label_names(&params, &cancel).await)
}

async fn label_values(
    State(api): State<Arc<Api>>,
    Path(name): Path<String>,
    uri: Uri,
) -> Response {
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();
    let params = Params::parse(uri.query(), None);
    into_response(api.label_values(&name, &params, &cancel).await)
}
