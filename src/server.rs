//! HTTP surface for the session and dispatch core.
//!
//! Four routes, mirroring the boundary contract consumed by automation
//! clients: `GET /health`, `POST /launch`, `POST /execute`, `POST /close`.
//! Action outcomes always travel as HTTP 200 with an [`ActionEnvelope`]
//! body; the envelope, not the status code, is the error channel.
//!
//! The server keeps one "current" page shared across clients. `/execute`
//! re-acquires it transparently when it is missing or closed, and dispatch
//! is serialized through the current-page lock so operations against the
//! same page run in submission order.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::Mutex;

use crate::actions::Dispatcher;
use crate::config::ChromebotConfig;
use crate::driver::{BrowserDriver, PageHandle};
use crate::envelope::{ActionEnvelope, JsonObject};
use crate::logging::ChromebotLogger;
use crate::session::{SessionError, SessionManager};

/// Body of a `POST /execute` request.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecuteRequest {
    pub action: String,
    #[serde(default)]
    pub params: JsonObject,
}

/// Body of a `GET /health` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub browser: String,
    pub pages: usize,
}

/// Errors that abort server startup or shutdown.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Shared state handed to every route handler.
pub struct AppState<D: BrowserDriver> {
    session: Arc<SessionManager<D>>,
    dispatcher: Dispatcher,
    current_page: Arc<Mutex<Option<PageHandle>>>,
    logger: Arc<ChromebotLogger>,
}

impl<D: BrowserDriver> Clone for AppState<D> {
    fn clone(&self) -> Self {
        AppState {
            session: Arc::clone(&self.session),
            dispatcher: self.dispatcher.clone(),
            current_page: Arc::clone(&self.current_page),
            logger: Arc::clone(&self.logger),
        }
    }
}

impl<D: BrowserDriver> AppState<D> {
    pub fn new(session: Arc<SessionManager<D>>, logger: Arc<ChromebotLogger>) -> Self {
        let dispatcher = Dispatcher::new(session.config().timeout_ms);
        AppState {
            session,
            dispatcher,
            current_page: Arc::new(Mutex::new(None)),
            logger,
        }
    }

    pub fn session(&self) -> &Arc<SessionManager<D>> {
        &self.session
    }
}

/// Build the application router (shared between production startup and
/// tests).
pub fn build_router<D: BrowserDriver + 'static>(state: AppState<D>) -> Router {
    Router::new()
        .route("/health", get(health_handler::<D>))
        .route("/launch", post(launch_handler::<D>))
        .route("/execute", post(execute_handler::<D>))
        .route("/close", post(close_handler::<D>))
        .with_state(state)
}

async fn health_handler<D: BrowserDriver + 'static>(
    State(state): State<AppState<D>>,
) -> Json<HealthResponse> {
    let status = state.session.status().await;
    Json(HealthResponse {
        status: "ok".to_string(),
        browser: if status.connected {
            "connected".to_string()
        } else {
            "disconnected".to_string()
        },
        pages: status.page_count,
    })
}

async fn launch_handler<D: BrowserDriver + 'static>(
    State(state): State<AppState<D>>,
) -> Json<ActionEnvelope> {
    let mut current = state.current_page.lock().await;
    match ensure_current_page(&state, &mut current).await {
        Ok(_) => {
            let mut data = JsonObject::new();
            data.insert("status".to_string(), "ok".into());
            Json(ActionEnvelope::success("launch", data))
        }
        Err(err) => Json(ActionEnvelope::failure("launch", err)),
    }
}

async fn execute_handler<D: BrowserDriver + 'static>(
    State(state): State<AppState<D>>,
    Json(request): Json<ExecuteRequest>,
) -> Json<ActionEnvelope> {
    let mut current = state.current_page.lock().await;
    let page = match ensure_current_page(&state, &mut current).await {
        Ok(page) => page,
        Err(err) => return Json(ActionEnvelope::failure(request.action, err)),
    };

    let envelope = state
        .dispatcher
        .execute(&request.action, page.as_ref(), &request.params)
        .await;

    if !envelope.success {
        state.logger.debug(
            format!(
                "action {} failed: {}",
                envelope.action,
                envelope.error.as_deref().unwrap_or_default()
            ),
            Some("dispatch"),
        );
    }

    Json(envelope)
}

async fn close_handler<D: BrowserDriver + 'static>(
    State(state): State<AppState<D>>,
) -> Json<ActionEnvelope> {
    let mut current = state.current_page.lock().await;

    if let Some(page) = current.take() {
        if let Err(err) = state.session.close_page(&page).await {
            return Json(ActionEnvelope::failure("close", err));
        }
    }

    match state.session.close_browser().await {
        Ok(()) => {
            let mut data = JsonObject::new();
            data.insert("status".to_string(), "closed".into());
            Json(ActionEnvelope::success("close", data))
        }
        Err(err) => Json(ActionEnvelope::failure("close", err)),
    }
}

/// Return the current page, re-acquiring one when none is open or the
/// previous one has closed.
async fn ensure_current_page<D: BrowserDriver>(
    state: &AppState<D>,
    current: &mut Option<PageHandle>,
) -> Result<PageHandle, SessionError> {
    if let Some(page) = current.as_ref() {
        if !page.is_closed() {
            return Ok(page.clone());
        }
    }

    let page = state.session.create_page().await?;
    *current = Some(page.clone());
    Ok(page)
}

/// Launch the browser, open the initial page, and serve the API until
/// ctrl-c, closing the browser on the way out.
pub async fn serve<D: BrowserDriver + 'static>(
    config: ChromebotConfig,
    driver: D,
) -> Result<(), ServerError> {
    let logger = Arc::new(ChromebotLogger::new(config.verbose));
    let port = config.port;
    let session = Arc::new(SessionManager::new(driver, config, logger.clone()));
    let state = AppState::new(session.clone(), logger.clone());

    {
        let mut current = state.current_page.lock().await;
        let page = session.create_page().await?;
        *current = Some(page);
    }

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    logger.info(
        format!("chromebot listening on http://localhost:{port}"),
        Some("server"),
    );

    let shutdown_logger = logger.clone();
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            shutdown_logger.info("shutting down", Some("server"));
        })
        .await?;

    session.close_browser().await?;
    Ok(())
}
