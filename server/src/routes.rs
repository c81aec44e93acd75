use axum::http::HeaderValue;
use axum::{middleware, Router};
use std::sync::Arc;
use tower_governor::key_extractor::PeerIpKeyExtractor;
use tower_governor::{governor::GovernorConfigBuilder, GovernorLayer};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use crate::auth::middleware::JwtSecret;
use crate::chat::messages as chat;
use crate::complaints::crud as complaints;
use crate::content::pages as content;
use crate::orders::{crud as orders, tracking};
use crate::state::AppState;
use crate::ws::handler as ws_handler;

/// Inject the JWT secret into request extensions so the Claims extractor can find it.
async fn inject_jwt_secret(
    axum::extract::State(state): axum::extract::State<AppState>,
    mut req: axum::http::Request<axum::body::Body>,
    next: middleware::Next,
) -> axum::response::Response {
    req.extensions_mut()
        .insert(JwtSecret(state.jwt_secret.clone()));
    next.run(req).await
}

/// CORS for the web app. An unset or unparsable origin allows any origin.
fn cors_layer(origin: Option<&str>) -> CorsLayer {
    let allow_origin = match origin.map(str::parse::<HeaderValue>) {
        Some(Ok(value)) => AllowOrigin::exact(value),
        Some(Err(e)) => {
            tracing::warn!(error = %e, "Invalid CORS origin, allowing any origin");
            AllowOrigin::from(Any)
        }
        None => AllowOrigin::from(Any),
    };
    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods(Any)
        .allow_headers(Any)
}

/// Build the full axum Router with all routes and middleware.
pub fn build_router(state: AppState, cors_origin: Option<&str>) -> Router {
    // Rate limiting: 5 complaints per minute per IP
    // Uses PeerIpKeyExtractor which reads from ConnectInfo<SocketAddr>
    let governor_config = Arc::new(
        GovernorConfigBuilder::default()
            .key_extractor(PeerIpKeyExtractor)
            .per_second(12) // 1 token every 12 seconds = 5 per minute
            .burst_size(5) // Allow burst of 5
            .finish()
            .expect("Failed to build governor config"),
    );
    let governor_limiter = governor_config.limiter().clone();

    // Spawn background task to clean up rate limiter state
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            governor_limiter.retain_recent();
        }
    });

    // Complaint filing is rate limited per IP
    let complaint_filing_routes = Router::new()
        .route(
            "/api/complaints",
            axum::routing::post(complaints::create_complaint),
        )
        .layer(GovernorLayer {
            config: governor_config,
        });

    // Public routes (no auth required, no rate limiting)
    let public_routes = Router::new()
        .route("/health", axum::routing::get(health_check))
        .route("/api/content/{slug}", axum::routing::get(content::get_page));

    // Authenticated routes (JWT required, Claims extractor validates token)
    let order_routes = Router::new()
        .route("/api/orders", axum::routing::get(orders::list_orders))
        .route("/api/orders", axum::routing::post(orders::create_order))
        .route("/api/orders/{order_id}", axum::routing::get(orders::get_order))
        .route(
            "/api/orders/{order_id}/status",
            axum::routing::put(tracking::set_status),
        )
        .route(
            "/api/orders/{order_id}/assign",
            axum::routing::put(tracking::assign_rider),
        )
        .route(
            "/api/orders/{order_id}/location",
            axum::routing::post(tracking::report_location),
        );

    // Note: /api/chat/active is static and wins over /api/chat/{order_id}/...
    let chat_routes = Router::new()
        .route("/api/chat/active", axum::routing::get(chat::list_active_chats))
        .route(
            "/api/chat/{order_id}/messages",
            axum::routing::get(chat::get_messages),
        )
        .route(
            "/api/chat/{order_id}/messages",
            axum::routing::post(chat::create_message),
        )
        .route(
            "/api/chat/{order_id}/read",
            axum::routing::put(chat::mark_thread_read),
        );

    // Note: /api/complaints/my and /stats must not be shadowed by /{complaint_id}
    let complaint_routes = Router::new()
        .route("/api/complaints", axum::routing::get(complaints::list_complaints))
        .route("/api/complaints/my", axum::routing::get(complaints::my_complaints))
        .route(
            "/api/complaints/stats",
            axum::routing::get(complaints::complaint_stats),
        )
        .route(
            "/api/complaints/{complaint_id}",
            axum::routing::get(complaints::get_complaint),
        )
        .route(
            "/api/complaints/{complaint_id}/status",
            axum::routing::put(complaints::update_complaint_status),
        );

    // Admin routes (role checked inside the handler)
    let admin_routes = Router::new().route(
        "/api/content/{slug}",
        axum::routing::post(content::upsert_page),
    );

    // WebSocket endpoint (auth via query param, not JWT header)
    let ws_routes = Router::new().route("/ws", axum::routing::get(ws_handler::ws_upgrade));

    Router::new()
        .merge(complaint_filing_routes)
        .merge(public_routes)
        .merge(order_routes)
        .merge(chat_routes)
        .merge(complaint_routes)
        .merge(admin_routes)
        .merge(ws_routes)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            inject_jwt_secret,
        ))
        .layer(cors_layer(cors_origin))
        .with_state(state)
}

/// Basic health check endpoint
async fn health_check() -> &'static str {
    "ok"
}
