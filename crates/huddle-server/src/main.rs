use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    extract::{State, WebSocketUpgrade},
    middleware,
    response::IntoResponse,
    routing::{get, post},
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use huddle_api::auth::{self, AppState, AppStateInner};
use huddle_api::channels;
use huddle_api::messages;
use huddle_api::middleware::require_auth;
use huddle_gateway::connection::{self, GatewayContext};
use huddle_gateway::dispatcher::Dispatcher;
use huddle_gateway::typing::{DEFAULT_TYPING_TIMEOUT, TypingTracker};
use huddle_registry::ChannelRegistry;

#[derive(Clone)]
struct ServerState {
    gateway: GatewayContext,
    jwt_secret: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "huddle=debug,tower_http=debug".into()),
        )
        .init();

    // Config
    let jwt_secret =
        std::env::var("HUDDLE_JWT_SECRET").unwrap_or_else(|_| "dev-secret-change-me".into());
    let db_path = std::env::var("HUDDLE_DB_PATH").unwrap_or_else(|_| "huddle.db".into());
    let host = std::env::var("HUDDLE_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = std::env::var("HUDDLE_PORT")
        .unwrap_or_else(|_| "3000".into())
        .parse()?;
    let typing_timeout = match std::env::var("HUDDLE_TYPING_TIMEOUT_MS") {
        Ok(raw) => Duration::from_millis(raw.parse()?),
        Err(_) => DEFAULT_TYPING_TIMEOUT,
    };

    // Init database
    let db = Arc::new(huddle_db::Database::open(&PathBuf::from(&db_path))?);

    // Shared state
    let registry = ChannelRegistry::new(db.clone());
    let dispatcher = Dispatcher::new();
    let typing = TypingTracker::new(dispatcher.clone(), typing_timeout);

    let app_state: AppState = Arc::new(AppStateInner {
        db: db.clone(),
        registry: registry.clone(),
        jwt_secret: jwt_secret.clone(),
    });

    let state = ServerState {
        gateway: GatewayContext {
            dispatcher,
            typing,
            registry,
            db,
        },
        jwt_secret,
    };

    // Routes
    let public_routes = Router::new()
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .with_state(app_state.clone());

    let protected_routes = Router::new()
        .route("/channels", get(channels::list_channels))
        .route("/channels", post(channels::create_channel))
        .route("/channels/{channel_id}/join", post(channels::join_channel))
        .route("/channels/{channel_id}/messages", get(messages::get_messages))
        .layer(middleware::from_fn(require_auth))
        .with_state(app_state);

    let ws_route = Router::new()
        .route("/gateway", get(ws_upgrade))
        .with_state(state);

    let app = Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("Huddle server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn ws_upgrade(
    State(state): State<ServerState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| {
        connection::handle_connection(socket, state.gateway, state.jwt_secret)
    })
}
