//! The authenticated request gateway.
//!
//! Every API call goes through [`Gateway::call`], which attaches the current access token and
//! recovers from an expired one without the caller noticing: the first 401 of a failure wave
//! starts exactly one renewal against `refresh_token`, every other 401 that arrives while it is
//! in flight waits for that same outcome, and each failed call is replayed once with the new
//! token.  A renewal failure is terminal: credentials are cleared and the UI is sent to the
//! login entry point.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use reqwest::header;
use serde::de::DeserializeOwned;
use tokio::sync::oneshot;

use crate::auth::TokenResponse;
use crate::config::ClientConfig;
use crate::credentials::CredentialStore;
use crate::error::{Error, Result};
use crate::observability::{
    GATEWAY_FORCED_LOGOUTS, GATEWAY_RENEWAL_DURATION, GATEWAY_RENEWAL_FAILURES,
    GATEWAY_RENEWAL_WAITERS, GATEWAY_RENEWALS, GATEWAY_REPLAYS, GATEWAY_REQUESTS,
    GATEWAY_UNAUTHORIZED,
};
use crate::transport::{ApiRequest, ApiResponse, HttpTransport, StreamResponse, Transport};

/// Path of the credential renewal endpoint.
pub const REFRESH_PATH: &str = "refresh_token";

/// Where the UI currently is, and how to send it to the login entry point.
pub trait LoginRedirect: Send + Sync {
    /// The current UI location.
    fn current_location(&self) -> String;

    /// Navigate to the login entry point.
    fn redirect_to_login(&self, login_path: &str);
}

/// In-process [`LoginRedirect`] that records the location it was sent to.
#[derive(Debug, Default)]
pub struct LocationTracker {
    location: Mutex<String>,
    redirects: Mutex<usize>,
}

impl LocationTracker {
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            location: Mutex::new(location.into()),
            redirects: Mutex::new(0),
        }
    }

    /// Record a navigation made by the UI.
    pub fn navigate(&self, location: impl Into<String>) {
        *lock(&self.location) = location.into();
    }

    /// How many times the gateway forced a redirect.
    pub fn redirects(&self) -> usize {
        *lock(&self.redirects)
    }
}

impl LoginRedirect for LocationTracker {
    fn current_location(&self) -> String {
        lock(&self.location).clone()
    }

    fn redirect_to_login(&self, login_path: &str) {
        *lock(&self.location) = login_path.to_string();
        *lock(&self.redirects) += 1;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// What a renewal hands to every caller waiting on it: the new access token, or the failure.
type RenewalOutcome = Result<String>;

/// Whether a credential renewal is in flight.
#[derive(Debug, Default)]
pub enum RefreshState {
    #[default]
    Idle,
    Refreshing {
        /// Callers that hit a 401 while the renewal was in flight.
        waiters: Vec<oneshot::Sender<RenewalOutcome>>,
    },
}

impl RefreshState {
    pub fn is_refreshing(&self) -> bool {
        matches!(self, RefreshState::Refreshing { .. })
    }
}

/// The single-flight guard around credential renewal.
#[derive(Debug, Default)]
pub struct RefreshCoordinator {
    state: Mutex<RefreshState>,
}

/// What a caller rejected with a 401 should do next.
enum Ticket {
    /// The token the request carried has been replaced; replay with the current one.
    Replay(String),
    /// No refresh token is held, so there is nothing to renew with.
    NoRefreshToken,
    /// This caller opened the renewal and must start it.
    Leader(oneshot::Receiver<RenewalOutcome>),
    /// A renewal is in flight; wait for its outcome.
    Waiter(oneshot::Receiver<RenewalOutcome>),
}

impl RefreshCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_refreshing(&self) -> bool {
        lock(&self.state).is_refreshing()
    }

    /// Decide what a caller whose request was sent with `sent` and rejected should do.
    ///
    /// A renewal commits its tokens before it settles, so checking the store under the state
    /// lock sees every token a finished renewal produced.
    fn join(&self, sent: Option<&str>, credentials: &CredentialStore) -> Ticket {
        let mut state = lock(&self.state);
        if let RefreshState::Refreshing { waiters } = &mut *state {
            let (tx, rx) = oneshot::channel();
            waiters.push(tx);
            return Ticket::Waiter(rx);
        }
        if let Some(current) = credentials.access_token()
            && sent != Some(current.as_str())
        {
            return Ticket::Replay(current);
        }
        if credentials.refresh_token().is_none() {
            return Ticket::NoRefreshToken;
        }
        let (tx, rx) = oneshot::channel();
        *state = RefreshState::Refreshing { waiters: vec![tx] };
        Ticket::Leader(rx)
    }

    fn settle(&self, outcome: Option<&RenewalOutcome>) {
        let previous = std::mem::take(&mut *lock(&self.state));
        if let RefreshState::Refreshing { waiters } = previous {
            // Dropping the senders without an outcome fails every waiter.
            if let Some(outcome) = outcome {
                for waiter in waiters {
                    let _ = waiter.send(outcome.clone());
                }
            }
        }
    }
}

/// Resets the coordinator if the renewal task dies before the renewal settles.
struct LeaderGuard {
    coordinator: Arc<RefreshCoordinator>,
    settled: bool,
}

impl LeaderGuard {
    fn settle(mut self, outcome: &RenewalOutcome) {
        self.settled = true;
        self.coordinator.settle(Some(outcome));
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        if !self.settled {
            self.coordinator.settle(None);
        }
    }
}

/// Wraps every outbound API call with credential handling.
#[derive(Clone)]
pub struct Gateway {
    transport: Arc<dyn Transport>,
    credentials: CredentialStore,
    redirect: Arc<dyn LoginRedirect>,
    refresh: Arc<RefreshCoordinator>,
    config: Arc<ClientConfig>,
}

impl Gateway {
    pub fn new(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
        credentials: CredentialStore,
        redirect: Arc<dyn LoginRedirect>,
    ) -> Self {
        Self {
            transport,
            credentials,
            redirect,
            refresh: Arc::new(RefreshCoordinator::new()),
            config: Arc::new(config),
        }
    }

    /// Build a gateway over HTTP for `config`.
    pub fn connect(
        config: ClientConfig,
        credentials: CredentialStore,
        redirect: Arc<dyn LoginRedirect>,
    ) -> Result<Self> {
        let transport = Arc::new(HttpTransport::new(&config)?);
        Ok(Self::new(config, transport, credentials, redirect))
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Whether a renewal is currently in flight.
    pub fn is_refreshing(&self) -> bool {
        self.refresh.is_refreshing()
    }

    /// Send `request` with the current access token and return the successful response.
    ///
    /// The request must not carry its own `Authorization` header.  An authorization failure is
    /// recovered from at most once; any other non-success status comes back as the matching
    /// [`Error`].
    pub async fn call(&self, request: ApiRequest) -> Result<ApiResponse> {
        if request.headers.contains_key(header::AUTHORIZATION) {
            return Err(Error::validation(
                "the gateway attaches the Authorization header itself",
                Some("Authorization".to_string()),
            ));
        }
        let mut request = request;
        if let Some(token) = self.credentials.access_token() {
            request.set_bearer(&token)?;
        }
        GATEWAY_REQUESTS.click();
        let response = self.transport.execute(&request).await?;
        if response.is_unauthorized() && !request.is_retried() {
            GATEWAY_UNAUTHORIZED.click();
            return self.recover(request, response).await;
        }
        response.error_for_status()
    }

    /// [`Gateway::call`] and deserialize the body.
    pub async fn call_json<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T> {
        self.call(request).await?.json()
    }

    /// Open a streamed response with the current access token.
    ///
    /// Streams are never renewed and replayed: a 401 here is returned as an error.
    pub async fn open_stream(&self, request: ApiRequest) -> Result<StreamResponse> {
        let mut request = request;
        if let Some(token) = self.credentials.access_token() {
            request.set_bearer(&token)?;
        }
        GATEWAY_REQUESTS.click();
        self.transport
            .open_stream(&request)
            .await?
            .error_for_status()
            .await
    }

    async fn recover(&self, mut request: ApiRequest, rejected: ApiResponse) -> Result<ApiResponse> {
        request.mark_retried();
        let original = rejected.error_for_status().err().unwrap_or_else(|| {
            Error::authentication("request was rejected as unauthorized")
        });

        let ticket = self.refresh.join(request.bearer_token(), &self.credentials);
        let outcome = match ticket {
            Ticket::Replay(current) => {
                tracing::debug!(path = %request.path, "replaying with a token renewed meanwhile");
                return self.replay(request, &current).await;
            }
            Ticket::NoRefreshToken => {
                tracing::info!("no refresh token held; logging out");
                self.force_logout();
                return Err(original);
            }
            Ticket::Leader(rx) => {
                self.spawn_renewal();
                rx
            }
            Ticket::Waiter(rx) => {
                GATEWAY_RENEWAL_WAITERS.click();
                rx
            }
        };
        let token = match outcome.await {
            Ok(outcome) => outcome?,
            Err(_) => {
                return Err(Error::renewal_failed(
                    "credential renewal was abandoned",
                    None,
                ));
            }
        };
        self.replay(request, &token).await
    }

    async fn replay(&self, mut request: ApiRequest, token: &str) -> Result<ApiResponse> {
        request.set_bearer(token)?;
        GATEWAY_REPLAYS.click();
        self.transport.execute(&request).await?.error_for_status()
    }

    /// Run the renewal on its own task.  Callers only wait on its outcome, so dropping any of
    /// them leaves the renewal running for the rest.
    fn spawn_renewal(&self) {
        let gateway = self.clone();
        tokio::spawn(async move {
            let guard = LeaderGuard {
                coordinator: gateway.refresh.clone(),
                settled: false,
            };
            let outcome = gateway.perform_renewal().await;
            guard.settle(&outcome);
        });
    }

    async fn perform_renewal(&self) -> RenewalOutcome {
        GATEWAY_RENEWALS.click();
        let started = Instant::now();
        let generation = self.credentials.generation();
        let Some(refresh_token) = self.credentials.refresh_token() else {
            return Err(self.fail_renewal(Error::renewal_failed("no refresh token held", None)));
        };
        tracing::info!("renewing access credential");

        let result = self.request_renewal(&refresh_token).await;
        GATEWAY_RENEWAL_DURATION.add(started.elapsed().as_secs_f64());
        let tokens = match result {
            Ok(tokens) => tokens,
            Err(err) => {
                tracing::warn!(error = %err, "credential renewal failed");
                return Err(self.fail_renewal(Error::renewal_failed(
                    "the refresh token was not accepted",
                    Some(err),
                )));
            }
        };

        // A logout or login during the renewal invalidates its result.
        let refresh_token = tokens.refresh_token.or(Some(refresh_token));
        if !self.credentials.set_if_generation(
            generation,
            tokens.access_token.clone(),
            refresh_token,
        ) {
            GATEWAY_RENEWAL_FAILURES.click();
            tracing::info!("credential replaced during renewal; discarding renewed tokens");
            return Err(Error::renewal_failed(
                "credentials changed while renewing",
                None,
            ));
        }
        tracing::info!("access credential renewed");
        Ok(tokens.access_token)
    }

    async fn request_renewal(&self, refresh_token: &str) -> Result<TokenResponse> {
        let request = ApiRequest::post(REFRESH_PATH)
            .json(&serde_json::json!({ "refresh_token": refresh_token }))?;
        self.transport
            .execute(&request)
            .await?
            .error_for_status()?
            .json()
    }

    fn fail_renewal(&self, err: Error) -> Error {
        GATEWAY_RENEWAL_FAILURES.click();
        self.force_logout();
        err
    }

    /// Clear credentials and, unless already there, navigate to the login entry point.
    pub(crate) fn force_logout(&self) {
        GATEWAY_FORCED_LOGOUTS.click();
        self.credentials.clear();
        let login_path = &self.config.login_path;
        if self.redirect.current_location() != *login_path {
            tracing::info!(login_path = %login_path, "redirecting to login");
            self.redirect.redirect_to_login(login_path);
        }
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("credentials", &self.credentials)
            .field("refreshing", &self.is_refreshing())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
