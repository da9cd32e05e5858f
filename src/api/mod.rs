use crate::config::Config;
use crate::domain::job::JobLimits;
use crate::services::DispatchEngine;
use axum::body::Body;
use axum::http::{HeaderName, Request};
use axum::{
    Router,
    routing::{any, get, post},
};
use std::sync::Arc;
use tower_http::request_id::{PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

pub mod health;
pub mod middleware;
pub mod push;
pub mod pushers;
pub mod schemas;
pub mod stats;

#[derive(Clone, Debug)]
pub struct AppState {
    pub engine: Arc<DispatchEngine>,
    pub limits: JobLimits,
}

impl AppState {
    #[must_use]
    pub fn new(engine: Arc<DispatchEngine>, config: &Config) -> Self {
        let limits = JobLimits {
            notification_max: config.core.notification_max,
            allows_empty_message: config.core.allows_empty_message,
        };
        Self { engine, limits }
    }
}

/// Configures and returns the application router.
pub fn app_router(state: AppState) -> Router {
    let request_id = HeaderName::from_static(middleware::REQUEST_ID_HEADER);

    Router::new()
        .route("/push", post(push::submit))
        .route("/stat/app", get(stats::app_stats))
        .route("/config/pushers", any(pushers::update_pushers))
        .route("/livez", get(health::livez))
        .layer(PropagateRequestIdLayer::new(request_id.clone()))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(move |request: &Request<Body>| {
                    let request_id = request
                        .extensions()
                        .get::<tower_http::request_id::RequestId>()
                        .map(|id| id.header_value().to_str().unwrap_or_default())
                        .unwrap_or_default()
                        .to_string();

                    tracing::info_span!(
                        "request",
                        "request_id" = %request_id,
                        "http.request.method" = %request.method(),
                        "url.path" = %request.uri().path(),
                        "http.response.status_code" = tracing::field::Empty,
                        "otel.kind" = "server",
                    )
                })
                .on_response(
                    |response: &axum::http::Response<_>, latency: std::time::Duration, _span: &tracing::Span| {
                        let status = response.status();
                        tracing::Span::current().record("http.response.status_code", status.as_u16());

                        tracing::info!(
                            latency_ms = %latency.as_millis(),
                            status = %status.as_u16(),
                            "request completed"
                        );
                    },
                )
                .on_failure(|error, _latency, _span: &tracing::Span| {
                    tracing::error!(error = %error, "request failed");
                }),
        )
        .layer(SetRequestIdLayer::new(request_id, middleware::MakeRequestUuidOrHeader))
        .with_state(state)
}
