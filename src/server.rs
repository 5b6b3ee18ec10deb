//! HTTP surface of the broker

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tower_http::{catch_panic::CatchPanicLayer, timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{error, info, warn};

use crate::account::{Account, AccountDirectory, account_table};
use crate::broker::{Broker, InteractionResult};
use crate::config::{Config, SessionConfig, StoreBackend, StoreConfig};
use crate::federation::{CallbackState, FederatedIdentityBridge, parse_onboarding_state};
use crate::mailer::LogMailer;
use crate::model::{ModelAdapter, model_table};
use crate::store::{KeyValueStore, MemoryStore, spawn_reaper};
use crate::{Error, Result};

/// Shared application state
pub struct AppState {
    /// Login and onboarding flows
    pub broker: Arc<Broker>,
    /// Cookie settings for the session assertion
    pub session: SessionConfig,
}

/// Create the router
pub fn create_router(state: Arc<AppState>, request_timeout: Duration) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/interaction/{uid}/login", post(login_handler))
        .route("/sgid/callback", get(sgid_callback_handler))
        .route("/onboarding/signup", post(signup_handler))
        .route("/onboarding/callback", get(onboarding_callback_handler))
        .route("/session", get(session_handler))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            request_timeout,
        ))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            error!(error = %self, code = self.code(), "Request failed");
        }
        // Upstream and store detail stays in the log.
        let description = if status.is_server_error() {
            match &self {
                Self::Store(_) | Self::Io(_) | Self::Json(_) | Self::Internal(_) => {
                    "Internal server error".to_string()
                }
                _ => self.to_string(),
            }
        } else {
            self.to_string()
        };
        (
            status,
            Json(json!({
                "error": self.code(),
                "error_description": description,
            })),
        )
            .into_response()
    }
}

/// Query string of provider callbacks
#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

impl CallbackQuery {
    fn code(&self) -> Result<&str> {
        if let Some(error) = &self.error {
            return Err(Error::FetchAccessToken(format!(
                "provider returned {error}: {}",
                self.error_description.as_deref().unwrap_or_default()
            )));
        }
        self.code
            .as_deref()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| Error::InvalidInput("missing authorization code".to_string()))
    }

    fn state(&self) -> Result<&str> {
        self.state.as_deref().ok_or(Error::InvalidState)
    }
}

/// Sign-up request body
#[derive(Debug, Deserialize)]
pub struct SignupRequest {
    email: String,
}

/// Finished login, as returned to the caller
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponse {
    interaction_uid: String,
    result: InteractionResult,
}

/// Bound account, as returned to the caller
#[derive(Debug, Serialize)]
struct OnboardedResponse {
    email: String,
    name: Option<String>,
}

impl From<Account> for OnboardedResponse {
    fn from(account: Account) -> Self {
        Self {
            name: account.display_name().map(str::to_string),
            email: account.email,
        }
    }
}

/// GET /health
async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// POST /interaction/{uid}/login - redirect the browser to sgID
async fn login_handler(
    State(state): State<Arc<AppState>>,
    Path(uid): Path<String>,
) -> Result<Redirect> {
    let url = state.broker.begin_login(&uid).await?;
    Ok(Redirect::to(&url))
}

/// GET /sgid/callback - shared provider callback, dispatched on state shape
async fn sgid_callback_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CallbackQuery>,
) -> Result<Response> {
    match CallbackState::classify(query.state()?)? {
        CallbackState::Login(login_state) => {
            let outcome = state
                .broker
                .complete_login(query.code()?, &login_state)
                .await?;
            let mut response = Json(LoginResponse {
                interaction_uid: outcome.interaction_uid,
                result: outcome.result,
            })
            .into_response();
            if let Some(assertion) = outcome.assertion {
                let cookie = session_cookie(&state.session, &assertion)?;
                response.headers_mut().insert(header::SET_COOKIE, cookie);
            }
            Ok(response)
        }
        CallbackState::Onboarding(token) => {
            let account = state
                .broker
                .complete_onboarding(query.code()?, &token)
                .await?;
            Ok(Json(OnboardedResponse::from(account)).into_response())
        }
    }
}

/// POST /onboarding/signup - start onboarding for an email address
async fn signup_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SignupRequest>,
) -> Result<StatusCode> {
    state.broker.begin_onboarding(&request.email).await?;
    Ok(StatusCode::ACCEPTED)
}

/// GET /onboarding/callback
async fn onboarding_callback_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CallbackQuery>,
) -> Result<Json<OnboardedResponse>> {
    let token = parse_onboarding_state(query.state()?)?;
    let account = state
        .broker
        .complete_onboarding(query.code()?, &token)
        .await?;
    Ok(Json(account.into()))
}

/// GET /session - verify the assertion cookie
///
/// A presented cookie that fails verification is cleared so the browser
/// starts over at sign-in.
async fn session_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response> {
    let token = read_cookie(&headers, &state.session.cookie_name);
    let verified = match state.broker.verify_session(token.as_deref()) {
        Ok(verified) => verified,
        Err(e) if token.is_some() && e.requires_reauthentication() => {
            let cleared = cookie_header(&state.session, "", 0)?;
            let mut response = e.into_response();
            response.headers_mut().insert(header::SET_COOKIE, cleared);
            return Ok(response);
        }
        Err(e) => return Err(e),
    };
    Ok(Json(json!({
        "subject": verified.subject,
        "email": verified.email,
    }))
    .into_response())
}

/// Value of cookie `name`, if present and non-empty.
fn read_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.to_string())
        .filter(|value| !value.is_empty())
}

fn session_cookie(session: &SessionConfig, assertion: &str) -> Result<HeaderValue> {
    cookie_header(session, assertion, session.max_age.as_secs())
}

fn cookie_header(session: &SessionConfig, value: &str, max_age: u64) -> Result<HeaderValue> {
    let mut cookie = format!(
        "{}={value}; Path=/; Max-Age={max_age}; HttpOnly; Secure; SameSite=Lax",
        session.cookie_name,
    );
    if let Some(domain) = &session.cookie_domain {
        cookie.push_str("; Domain=");
        cookie.push_str(domain);
    }
    HeaderValue::from_str(&cookie).map_err(|e| Error::Internal(format!("Invalid cookie: {e}")))
}

/// Build the configured store. The memory store gets a reaper bound to
/// `shutdown`.
pub async fn build_store(
    config: &StoreConfig,
    shutdown: &broadcast::Sender<()>,
) -> Result<Arc<dyn KeyValueStore>> {
    match config.backend {
        StoreBackend::Memory => {
            let store = Arc::new(MemoryStore::new(config.reclaim_delay));
            spawn_reaper(
                Arc::clone(&store),
                config.reaper_interval,
                shutdown.subscribe(),
            );
            let store: Arc<dyn KeyValueStore> = store;
            Ok(store)
        }
        #[cfg(feature = "dynamodb")]
        StoreBackend::Dynamodb => Ok(Arc::new(crate::store::DynamoStore::connect(config).await)),
        #[cfg(not(feature = "dynamodb"))]
        StoreBackend::Dynamodb => Err(Error::Config(
            "store.backend = dynamodb requires the `dynamodb` feature".to_string(),
        )),
    }
}

/// Wire the broker from configuration and a store.
pub fn build_state(config: &Config, store: Arc<dyn KeyValueStore>) -> Result<AppState> {
    let prefix = &config.store.table_prefix;
    let interactions = Arc::new(ModelAdapter::new(
        "Interaction",
        Arc::clone(&store),
        model_table(prefix),
        config.ttl.client_model,
    ));
    let accounts = Arc::new(AccountDirectory::new(store, account_table(prefix)));
    let bridge = Arc::new(FederatedIdentityBridge::from_config(config)?);
    let broker = Broker::new(interactions, accounts, bridge, Arc::new(LogMailer));
    Ok(AppState {
        broker: Arc::new(broker),
        session: config.session.clone(),
    })
}

/// Run the HTTP server until Ctrl-C or SIGTERM.
pub async fn serve(config: Config) -> Result<()> {
    let addr = SocketAddr::new(
        config
            .server
            .host
            .parse()
            .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
        config.server.port,
    );

    let (shutdown_tx, _) = broadcast::channel(1);
    let store = build_store(&config.store, &shutdown_tx).await?;
    let state = Arc::new(build_state(&config, store)?);
    let app = create_router(state, config.server.request_timeout);

    let listener = TcpListener::bind(addr).await?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        host = %config.server.host,
        port = config.server.port,
        store = ?config.store.backend,
        "Listening"
    );

    let mut drain_rx = shutdown_tx.subscribe();
    let mut server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = drain_rx.recv().await;
            })
            .await
    });

    tokio::select! {
        joined = &mut server => return flatten(joined),
        () = shutdown_signal(shutdown_tx) => {}
    }

    match tokio::time::timeout(config.server.shutdown_timeout, server).await {
        Ok(joined) => flatten(joined),
        Err(_) => {
            warn!(
                timeout = ?config.server.shutdown_timeout,
                "In-flight requests did not drain before the shutdown timeout"
            );
            Ok(())
        }
    }
}

fn flatten(
    joined: std::result::Result<std::io::Result<()>, tokio::task::JoinError>,
) -> Result<()> {
    joined
        .map_err(|e| Error::Internal(e.to_string()))?
        .map_err(Error::from)
}

/// Shutdown signal handler
async fn shutdown_signal(shutdown_tx: broadcast::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
}
