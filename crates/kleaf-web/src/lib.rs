//! HTTP surface: one random trivia item per request and today's historical events.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{
    extract::State,
    http::{HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{Datelike, Utc};
use kleaf_core::{
    env_duration, env_or, env_parse, EventsOnThisDayResponse, Image, OnThisDayEvent,
    OnThisDayEventReference, RandomTriviaResponse,
};
use kleaf_trivia::{TriviaError, TriviaService};
use kleaf_wiki::{FeedEvent, FeedPage, OnThisDayFeed};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, info_span, Span};

pub const CRATE_NAME: &str = "kleaf-web";

const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Clone)]
pub struct AppState {
    pub trivia: Arc<TriviaService>,
}

impl AppState {
    pub fn new(trivia: Arc<TriviaService>) -> Self {
        Self { trivia }
    }
}

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub port: u16,
    pub allowed_origins: Vec<String>,
    pub request_timeout: Duration,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            port: 4000,
            allowed_origins: vec!["http://localhost".to_string()],
            request_timeout: Duration::from_secs(15),
        }
    }
}

impl WebConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let port = env_parse("KLEAF_PORT", env_parse("PORT", defaults.port));
        let allowed_origins = env_or("ALLOWED_ORIGINS", "http://localhost")
            .split(',')
            .map(str::trim)
            .filter(|o| !o.is_empty())
            .map(String::from)
            .collect();
        Self {
            port,
            allowed_origins,
            request_timeout: env_duration("REQUEST_TIMEOUT", defaults.request_timeout),
        }
    }
}

pub fn app(state: AppState, config: &WebConfig) -> Router {
    Router::new()
        .route("/trivia/random", get(random_trivia_handler))
        .route("/on-this-day/events", get(on_this_day_handler))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(TraceLayer::new_for_http())
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(cors_layer(&config.allowed_origins))
                .layer(TimeoutLayer::with_status_code(
                    StatusCode::GATEWAY_TIMEOUT,
                    config.request_timeout,
                )),
        )
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, config: WebConfig) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, backend = ?state.trivia.source().backend(), "listening");

    axum::serve(listener, app(state, &config))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving http")?;

    info!("server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "installing ctrl-c handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "installing terminate handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c, shutting down"),
        _ = terminate => info!("received terminate signal, shutting down"),
    }
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let allow_origin = if origins.iter().any(|o| o == "*") {
        AllowOrigin::from(Any)
    } else {
        AllowOrigin::list(
            origins
                .iter()
                .filter_map(|o| HeaderValue::from_str(o).ok()),
        )
    };
    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .max_age(Duration::from_secs(300))
}

fn request_span(headers: &HeaderMap, operation: &'static str) -> Span {
    let request_id = headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    info_span!("request", request_id, http_method = "GET", operation)
}

async fn random_trivia_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    let span = request_span(&headers, "random_trivia");
    // Outbound calls stop once this future is dropped, e.g. by the timeout layer.
    let cancel = CancellationToken::new();
    let _cancel_on_drop = cancel.clone().drop_guard();

    match state.trivia.random_trivia(&cancel, &span).await {
        Ok(summary) => Json(RandomTriviaResponse {
            results: vec![summary.into()],
        })
        .into_response(),
        Err(err) => request_failed(&span, &err),
    }
}

async fn on_this_day_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    let span = request_span(&headers, "on_this_day");
    let cancel = CancellationToken::new();
    let _cancel_on_drop = cancel.clone().drop_guard();

    let today = Utc::now();
    match state
        .trivia
        .on_this_day(today.month(), today.day(), &cancel)
        .await
    {
        Ok(feed) => Json(shape_events(feed)).into_response(),
        Err(err) => request_failed(&span, &err),
    }
}

fn request_failed(span: &Span, err: &TriviaError) -> Response {
    error!(parent: span, error = %err, "request failed");
    (StatusCode::INTERNAL_SERVER_ERROR, "request failed").into_response()
}

/// One item per event. The event text is the title; the other fields come
/// from the first linked page and every linked page becomes a reference.
pub fn shape_events(feed: OnThisDayFeed) -> EventsOnThisDayResponse {
    EventsOnThisDayResponse {
        titles: feed.events.into_iter().map(shape_event).collect(),
    }
}

fn shape_event(event: FeedEvent) -> OnThisDayEvent {
    let references = event
        .pages
        .iter()
        .map(|page| OnThisDayEventReference {
            title: page_title(page),
            url: page.content_urls.desktop.page.clone(),
        })
        .collect();
    let mut shaped = OnThisDayEvent {
        title: event.text,
        references,
        year: event.year.unwrap_or_default(),
        ..Default::default()
    };
    if let Some(page) = event.pages.into_iter().next() {
        shaped.short_title = page_title(&page);
        shaped.description = page.description;
        shaped.extract = page.extract;
        shaped.url = page.content_urls.desktop.page;
        shaped.image = page
            .thumbnail
            .map(|t| Image {
                url: t.source,
                width: t.width,
                height: t.height,
            })
            .unwrap_or_default();
    }
    shaped
}

fn page_title(page: &FeedPage) -> String {
    if page.titles.normalized.is_empty() {
        page.title.replace('_', " ")
    } else {
        page.titles.normalized.clone()
    }
}
