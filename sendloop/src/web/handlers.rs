//! Tracking endpoint handlers.
//!
//! These handlers are designed to be fast and fail-open:
//! 1. Extract the tracking id and client metadata
//! 2. Record the event (one lookup, one insert, one conditional update)
//! 3. Answer with the pixel / redirect regardless of the recording outcome

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::model::TrackingId;
use crate::tracking::{ClientMeta, EventRecorder};

/// 1x1 transparent GIF served for every open request.
const TRACKING_PIXEL: &[u8] = &[
    0x47, 0x49, 0x46, 0x38, 0x39, 0x61, // GIF89a
    0x01, 0x00, 0x01, 0x00, 0x80, 0x00, 0x00, // 1x1, global palette
    0x00, 0x00, 0x00, 0xff, 0xff, 0xff, // black, white
    0x21, 0xf9, 0x04, 0x01, 0x00, 0x00, 0x00, 0x00, // transparent GCE
    0x2c, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, // image descriptor
    0x02, 0x02, 0x44, 0x01, 0x00, // image data
    0x3b, // trailer
];

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub recorder: Arc<EventRecorder>,
    /// Where to send a click that arrives without a usable target.
    pub fallback_redirect_url: Arc<String>,
}

impl AppState {
    pub fn new(recorder: Arc<EventRecorder>, fallback_redirect_url: String) -> Self {
        Self {
            recorder,
            fallback_redirect_url: Arc::new(fallback_redirect_url),
        }
    }
}

/// Build the tracking router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/t/open", get(track_open))
        .route("/t/click", get(track_click))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// =============================================================================
// Health Check
// =============================================================================

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

// =============================================================================
// Open pixel
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct OpenParams {
    #[serde(default)]
    pub tracking_id: Option<String>,
}

/// Open tracking pixel endpoint.
///
/// Always returns the pixel, even for a missing or unrecognized tracking id.
pub async fn track_open(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<OpenParams>,
) -> impl IntoResponse {
    match params.tracking_id {
        Some(id) if !id.is_empty() => {
            let tracking_id = TrackingId::from(id);
            state
                .recorder
                .record_open(&tracking_id, client_meta(&headers))
                .await;
        }
        _ => {
            warn!("tracking_open_missing_id");
        }
    }

    pixel_response()
}

fn pixel_response() -> impl IntoResponse {
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "image/gif"),
            (
                header::CACHE_CONTROL,
                "no-cache, no-store, must-revalidate",
            ),
        ],
        TRACKING_PIXEL,
    )
}

// =============================================================================
// Click redirect
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct ClickParams {
    #[serde(default)]
    pub tracking_id: Option<String>,
    #[serde(default)]
    pub target: Option<String>,
}

/// Click redirect endpoint.
///
/// Always issues a `302` to the target (or the configured fallback when the
/// target is missing or unparseable), so a stale or forged tracking id never
/// strands the recipient.
pub async fn track_click(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<ClickParams>,
) -> impl IntoResponse {
    let destination = match params.target.as_deref().filter(|t| !t.is_empty()) {
        Some(target) => match url::Url::parse(target) {
            Ok(_) => target.to_string(),
            Err(e) => {
                warn!(raw_target = %target, error = %e, "tracking_click_bad_target");
                state.fallback_redirect_url.as_ref().clone()
            }
        },
        None => {
            warn!("tracking_click_missing_target");
            state.fallback_redirect_url.as_ref().clone()
        }
    };

    if let Some(id) = params.tracking_id.filter(|id| !id.is_empty()) {
        let tracking_id = TrackingId::from(id);
        state
            .recorder
            .record_click(&tracking_id, &destination, client_meta(&headers))
            .await;
    }

    info!(destination = %destination, "tracking_click_redirect");

    (StatusCode::FOUND, [(header::LOCATION, destination)])
}

/// Best-effort client metadata from request headers.
fn client_meta(headers: &HeaderMap) -> ClientMeta {
    let header_str = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string())
    };
    ClientMeta {
        ip: header_str("x-forwarded-for"),
        user_agent: header_str("user-agent"),
    }
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use chrono::TimeZone;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use super::*;
    use crate::clock::FixedClock;
    use crate::store::MemoryStore;

    fn test_app() -> (Router, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(FixedClock(
            chrono::Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
        ));
        let recorder = Arc::new(EventRecorder::new(store.clone(), clock));
        let app = router(AppState::new(
            recorder,
            "https://www.example.com/".to_string(),
        ));
        (app, store)
    }

    async fn get(app: Router, uri: &str) -> axum::response::Response {
        let request = Request::builder()
            .method("GET")
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        app.oneshot(request).await.unwrap()
    }

    #[tokio::test]
    async fn test_health_returns_ok() {
        let (app, _) = test_app();
        let response = get(app, "/health").await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_open_returns_pixel_for_unknown_id() {
        let (app, _) = test_app();
        let response = get(app, "/t/open?tracking_id=deadbeef").await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "image/gif"
        );
        assert_eq!(
            response.headers().get(header::CACHE_CONTROL).unwrap(),
            "no-cache, no-store, must-revalidate"
        );

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..6], b"GIF89a");
        assert_eq!(body.len(), TRACKING_PIXEL.len());
    }

    #[tokio::test]
    async fn test_open_without_id_still_returns_pixel() {
        let (app, _) = test_app();
        let response = get(app, "/t/open").await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_click_unrecognized_id_still_redirects() {
        let (app, _) = test_app();
        let response = get(
            app,
            "/t/click?tracking_id=bogus&target=https%3A%2F%2Fexample.com%2F",
        )
        .await;

        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            response.headers().get(header::LOCATION).unwrap(),
            "https://example.com/"
        );
    }

    #[tokio::test]
    async fn test_click_without_target_uses_fallback() {
        let (app, _) = test_app();
        let response = get(app, "/t/click?tracking_id=bogus").await;

        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            response.headers().get(header::LOCATION).unwrap(),
            "https://www.example.com/"
        );
    }

    #[tokio::test]
    async fn test_click_bad_target_uses_fallback() {
        let (app, _) = test_app();
        let response = get(app, "/t/click?tracking_id=bogus&target=not%20a%20url").await;

        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            response.headers().get(header::LOCATION).unwrap(),
            "https://www.example.com/"
        );
    }
}
