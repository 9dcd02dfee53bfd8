//! Portal client capability
//!
//! The reconciler only needs to load pages, wait for form inputs, submit
//! a form and observe navigations. How a page is rendered is up to the
//! implementation.

use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::PortalError;

/// Session probe page; shows the account name when logged in
pub const STATUS_PATH: &str = "/status";

/// Ends the current session; may 404 on some portals
pub const LOGOUT_PATH: &str = "/logout";

/// Renders the credential form
pub const LOGIN_PATH: &str = "/login";

/// Handle that resolves on the first navigation after it was taken
#[derive(Debug)]
pub struct NavigationWatch {
    rx: watch::Receiver<u64>,
}

impl NavigationWatch {
    /// Wrap a navigation counter receiver, treating its current value as seen
    pub fn new(mut rx: watch::Receiver<u64>) -> Self {
        rx.borrow_and_update();
        Self { rx }
    }

    /// Wait for the next navigation
    pub async fn navigated(mut self) -> Result<(), PortalError> {
        self.rx.changed().await.map_err(|_| PortalError::Closed)
    }
}

/// Abstraction over something that can drive the portal's web pages
#[async_trait]
pub trait PortalClient: Send + Sync {
    /// Navigate to `path` relative to the portal base and return the page content
    async fn fetch_page(&self, path: &str) -> Result<String, PortalError>;

    /// Wait until the current page has inputs with all of the given names
    async fn wait_for_fields(&self, names: &[&str]) -> Result<(), PortalError>;

    /// Fill the form holding the named inputs and submit it
    async fn submit_form(&self, fields: Vec<(String, String)>) -> Result<(), PortalError>;

    /// Observe the next navigation, whatever triggers it
    ///
    /// Must be taken before the action that navigates so the event is not missed.
    fn watch_navigation(&self) -> NavigationWatch;

    /// Content of the current page
    async fn page_content(&self) -> Result<String, PortalError>;

    /// Release any resources held by the client
    async fn close(&self) {}
}
