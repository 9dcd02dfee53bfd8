//! Session reconciliation
//!
//! One pass of: probe the status page, and if the account name is not on
//! it, log out (best effort), load the login form, submit the credentials
//! and check the result. Every portal failure ends the pass in a terminal
//! outcome instead of bubbling up; the next scheduled run retries.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::{sleep, timeout, timeout_at, Instant};

use pk_core::config::Secret;
use pk_core::traits::{PortalClient, LOGIN_PATH, LOGOUT_PATH, STATUS_PATH};
use pk_core::PortalError;

/// Name of the account input on the login form
pub const USERNAME_FIELD: &str = "username";

/// Name of the password input on the login form
pub const PASSWORD_FIELD: &str = "password";

/// Time budgets for each portal interaction
///
/// Fixed so that a scheduled pass always finishes in bounded time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    /// Loading the status or login page
    pub page_load: Duration,
    /// Best-effort logout before logging in
    pub logout: Duration,
    /// Waiting for the credential inputs to appear
    pub form_wait: Duration,
    /// Submitting the form and waiting for the resulting navigation
    pub navigation: Duration,
    /// Pause after submission for redirects to land
    pub settle: Duration,
    /// Fetching the status page again to confirm the login
    pub recheck: Duration,
}

impl Timings {
    pub const FIXED: Timings = Timings {
        page_load: Duration::from_secs(12),
        logout: Duration::from_secs(3),
        form_wait: Duration::from_secs(10),
        navigation: Duration::from_secs(15),
        settle: Duration::from_secs(3),
        recheck: Duration::from_secs(5),
    };
}

impl Default for Timings {
    fn default() -> Self {
        Self::FIXED
    }
}

/// Account used to log in and to recognise a logged-in page
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: Secret,
}

/// Why a pass ended without an authenticated session
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCause {
    #[error("status page unreachable")]
    StatusUnreachable,

    #[error("login page unreachable")]
    LoginPageUnreachable,

    #[error("login form not found")]
    FormNotFound,

    #[error("login form submission failed")]
    SubmitFailed,

    /// Wrong credentials and an unexpected portal reply look the same
    #[error("credentials rejected or unexpected portal response")]
    CredentialsRejectedOrUnknown,
}

/// Terminal state of a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The status page already showed the account
    AlreadyAuthenticated,
    /// The login sequence produced an authenticated session
    LoggedIn,
    /// The pass gave up
    LoginFailed(FailureCause),
}

impl ReconcileOutcome {
    /// Whether the host ends the pass authenticated
    pub fn is_authenticated(&self) -> bool {
        !matches!(self, ReconcileOutcome::LoginFailed(_))
    }
}

/// Outcome of a pass plus how long it took
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileReport {
    pub outcome: ReconcileOutcome,
    pub elapsed: Duration,
}

/// Drives one check-then-login pass against a [`PortalClient`]
pub struct SessionReconciler<C> {
    client: Arc<C>,
    credentials: Credentials,
    timings: Timings,
}

impl<C: PortalClient + 'static> SessionReconciler<C> {
    pub fn new(client: Arc<C>, credentials: Credentials) -> Self {
        Self {
            client,
            credentials,
            timings: Timings::FIXED,
        }
    }

    /// Replace the time budgets (tests only need shorter ones)
    pub fn with_timings(mut self, timings: Timings) -> Self {
        self.timings = timings;
        self
    }

    /// Run the pass to completion and close the client
    pub async fn run(&self) -> ReconcileReport {
        let started = Instant::now();
        let outcome = self.reconcile().await;

        match outcome {
            ReconcileOutcome::AlreadyAuthenticated => {
                tracing::info!("Already connected as {}", self.credentials.username);
            }
            ReconcileOutcome::LoggedIn => {
                tracing::info!("Login succeeded as {}", self.credentials.username);
            }
            ReconcileOutcome::LoginFailed(cause) => {
                tracing::error!("Login failed: {}", cause);
            }
        }

        self.client.close().await;

        ReconcileReport {
            outcome,
            elapsed: started.elapsed(),
        }
    }

    async fn reconcile(&self) -> ReconcileOutcome {
        let status = match bounded(self.timings.page_load, self.client.fetch_page(STATUS_PATH)).await {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!("Status page {}: {}", STATUS_PATH, e);
                return ReconcileOutcome::LoginFailed(FailureCause::StatusUnreachable);
            }
        };

        if self.shows_account(&status) {
            return ReconcileOutcome::AlreadyAuthenticated;
        }

        tracing::info!("Not logged in -> logging in as {}", self.credentials.username);
        match self.log_in().await {
            Ok(()) => ReconcileOutcome::LoggedIn,
            Err(cause) => ReconcileOutcome::LoginFailed(cause),
        }
    }

    async fn log_in(&self) -> Result<(), FailureCause> {
        // Clears a half-open session; portals without the page are fine
        if let Err(e) = bounded(self.timings.logout, self.client.fetch_page(LOGOUT_PATH)).await {
            tracing::debug!("Logout ignored: {}", e);
        }

        bounded(self.timings.page_load, self.client.fetch_page(LOGIN_PATH))
            .await
            .map_err(|e| {
                tracing::warn!("Login page {}: {}", LOGIN_PATH, e);
                FailureCause::LoginPageUnreachable
            })?;

        bounded(
            self.timings.form_wait,
            self.client.wait_for_fields(&[USERNAME_FIELD, PASSWORD_FIELD]),
        )
        .await
        .map_err(|e| {
            tracing::warn!("Credential inputs: {}", e);
            FailureCause::FormNotFound
        })?;

        self.submit_and_wait().await?;

        sleep(self.timings.settle).await;

        if self.verify().await {
            Ok(())
        } else {
            Err(FailureCause::CredentialsRejectedOrUnknown)
        }
    }

    /// Submit the credentials while watching for the navigation it causes
    ///
    /// Both run as separate tasks under one deadline. Running out of time is
    /// tolerated on either side, since a portal may accept the credentials
    /// without ever answering; only a submission that fails is fatal.
    async fn submit_and_wait(&self) -> Result<(), FailureCause> {
        let navigation = self.client.watch_navigation();
        let mut navigated = tokio::spawn(navigation.navigated());

        let client = Arc::clone(&self.client);
        let fields = vec![
            (USERNAME_FIELD.to_string(), self.credentials.username.clone()),
            (
                PASSWORD_FIELD.to_string(),
                self.credentials.password.expose().to_string(),
            ),
        ];
        let mut submitted = tokio::spawn(async move { client.submit_form(fields).await });

        let deadline = Instant::now() + self.timings.navigation;
        let (nav, submit) = tokio::join!(
            timeout_at(deadline, &mut navigated),
            timeout_at(deadline, &mut submitted)
        );

        match nav {
            Ok(Ok(Ok(()))) => tracing::debug!("Navigation after submit completed"),
            Ok(Ok(Err(e))) => tracing::debug!("Navigation watch ended: {}", e),
            Ok(Err(e)) => tracing::warn!("Navigation watch task failed: {}", e),
            Err(_) => {
                navigated.abort();
                tracing::debug!(
                    "No navigation within {:?} after submit, continuing",
                    self.timings.navigation
                );
            }
        }

        match submit {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(PortalError::FormNotFound(e)))) => {
                tracing::warn!("Login form vanished before submit: {}", e);
                Err(FailureCause::FormNotFound)
            }
            Ok(Ok(Err(e))) => {
                tracing::warn!("Submitting credentials: {}", e);
                Err(FailureCause::SubmitFailed)
            }
            Ok(Err(e)) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Ok(Err(e)) => {
                tracing::warn!("Submit task failed: {}", e);
                Err(FailureCause::SubmitFailed)
            }
            Err(_) => {
                submitted.abort();
                tracing::warn!(
                    "No answer to the login form within {:?}, checking status anyway",
                    self.timings.navigation
                );
                Ok(())
            }
        }
    }

    /// Look for the account on the page we landed on, then on a fresh status page
    async fn verify(&self) -> bool {
        match self.client.page_content().await {
            Ok(content) if self.shows_account(&content) => return true,
            Ok(_) => tracing::debug!("Post-login page does not show the account"),
            Err(e) => tracing::debug!("Post-login page unavailable: {}", e),
        }

        match bounded(self.timings.recheck, self.client.fetch_page(STATUS_PATH)).await {
            Ok(status) => self.shows_account(&status),
            Err(e) => {
                tracing::warn!("Status page after login {}: {}", STATUS_PATH, e);
                false
            }
        }
    }

    fn shows_account(&self, content: &str) -> bool {
        content.contains(self.credentials.username.as_str())
    }
}

/// Await a portal call, failing with [`PortalError::Timeout`] past `limit`
async fn bounded<T>(
    limit: Duration,
    call: impl Future<Output = Result<T, PortalError>>,
) -> Result<T, PortalError> {
    timeout(limit, call)
        .await
        .map_err(|_| PortalError::Timeout(limit))?
}
