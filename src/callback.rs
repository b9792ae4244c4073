//! Short-lived loopback HTTP listener that receives the OAuth redirect.
//!
//! The listener is bound synchronously so a busy port fails before the user is
//! sent to the browser. Serving happens on a current-thread tokio runtime owned
//! by [`CallbackListener::wait_for_code`]; the wait races the handler's single
//! delivery, the server task and the deadline, and always shuts the server down
//! before returning.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use std::collections::HashMap;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};

use crate::error::{AuthError, AuthResult};

pub const CALLBACK_PATH: &str = "/callback";

const SUCCESS_PAGE: &str = "<html><body><h1>Authentication successful!</h1>\
<p>You can close this tab and return to the terminal.</p></body></html>";

type CallbackOutcome = AuthResult<String>;

struct CallbackState {
    expected_state: String,
    sender: Mutex<Option<oneshot::Sender<CallbackOutcome>>>,
}

impl CallbackState {
    /// Only the first caller gets the sender; later hits deliver nothing.
    async fn deliver(&self, outcome: CallbackOutcome) -> bool {
        match self.sender.lock().await.take() {
            Some(sender) => sender.send(outcome).is_ok(),
            None => false,
        }
    }
}

/// Router for `GET /callback`. The returned receiver resolves exactly once.
pub fn callback_router(expected_state: &str) -> (Router, oneshot::Receiver<CallbackOutcome>) {
    let (sender, receiver) = oneshot::channel();
    let state = Arc::new(CallbackState {
        expected_state: expected_state.to_string(),
        sender: Mutex::new(Some(sender)),
    });
    let router = Router::new()
        .route(CALLBACK_PATH, get(handle_callback))
        .with_state(state);
    (router, receiver)
}

async fn handle_callback(
    State(state): State<Arc<CallbackState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let received_state = params.get("state").map(String::as_str).unwrap_or_default();
    if received_state != state.expected_state {
        let delivered = state.deliver(Err(AuthError::StateMismatch)).await;
        warn!(delivered, "rejected callback with mismatched state");
        return (StatusCode::BAD_REQUEST, "State mismatch").into_response();
    }

    let code = params
        .get("code")
        .map(String::as_str)
        .filter(|code| !code.is_empty());
    let Some(code) = code else {
        let delivered = state.deliver(Err(AuthError::MissingCode)).await;
        warn!(delivered, "rejected callback without authorization code");
        return (StatusCode::BAD_REQUEST, "No authorization code").into_response();
    };

    let delivered = state.deliver(Ok(code.to_string())).await;
    debug!(delivered, "received authorization code");
    Html(SUCCESS_PAGE).into_response()
}

#[derive(Debug)]
pub struct CallbackListener {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl CallbackListener {
    pub fn bind(addr: &str) -> AuthResult<Self> {
        let listener = TcpListener::bind(addr).map_err(|err| {
            AuthError::Listener(format!("failed to start local server on {}: {}", addr, err))
        })?;
        listener.set_nonblocking(true).map_err(|err| {
            AuthError::Listener(format!("failed to configure local server: {}", err))
        })?;
        let local_addr = listener.local_addr().map_err(|err| {
            AuthError::Listener(format!("failed to read local server address: {}", err))
        })?;
        debug!(%local_addr, "callback listener bound");
        Ok(Self {
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serves the callback until a code or an error arrives or `timeout`
    /// elapses. The server gets `grace` to drain before it is aborted.
    pub fn wait_for_code(
        self,
        expected_state: &str,
        timeout: Duration,
        grace: Duration,
    ) -> AuthResult<String> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|err| {
                AuthError::Listener(format!("failed to start callback runtime: {}", err))
            })?;
        runtime.block_on(self.serve_until_outcome(expected_state, timeout, grace))
    }

    async fn serve_until_outcome(
        self,
        expected_state: &str,
        timeout: Duration,
        grace: Duration,
    ) -> AuthResult<String> {
        let listener = tokio::net::TcpListener::from_std(self.listener).map_err(|err| {
            AuthError::Listener(format!("failed to register local server: {}", err))
        })?;
        let (router, mut receiver) = callback_router(expected_state);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let mut server = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
        });

        let outcome = tokio::select! {
            delivered = &mut receiver => delivered.unwrap_or_else(|_| {
                Err(AuthError::Listener("callback handler dropped without a result".to_string()))
            }),
            served = &mut server => Err(AuthError::Listener(match served {
                Ok(Ok(())) => "local server stopped unexpectedly".to_string(),
                Ok(Err(err)) => format!("local server error: {}", err),
                Err(err) => format!("local server task failed: {}", err),
            })),
            _ = tokio::time::sleep(timeout) => Err(AuthError::Timeout(timeout)),
        };

        let _ = shutdown_tx.send(());
        if !server.is_finished() && tokio::time::timeout(grace, &mut server).await.is_err() {
            warn!(
                grace_ms = grace.as_millis() as u64,
                "callback server did not stop in time; aborting"
            );
            server.abort();
        }
        debug!(local_addr = %self.local_addr, ok = outcome.is_ok(), "callback listener closed");
        outcome
    }
}
