//! HTTP portal client
//!
//! Drives the portal with plain HTTP requests and a cookie jar: each page
//! load or form post becomes the "current page" and counts as a navigation.

pub mod form;

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Url};
use tokio::sync::{watch, Mutex};

use pk_core::config::PortalConfig;
use pk_core::traits::{NavigationWatch, PortalClient};
use pk_core::PortalError;

/// Interval between re-checks while waiting for form inputs
const FIELD_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Connection establishment limit; overall limits come from the caller
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// The page the client is currently "on"
#[derive(Debug, Clone)]
struct Page {
    url: Url,
    content: String,
}

/// [`PortalClient`] over `reqwest`
pub struct HttpPortalClient {
    http: Client,
    base_url: String,
    page: Mutex<Option<Page>>,
    navigations: watch::Sender<u64>,
}

impl HttpPortalClient {
    /// Build a client for the configured portal
    pub fn new(config: &PortalConfig) -> Result<Self, PortalError> {
        Self::with_options(
            &config.base_url,
            config.accept_invalid_certs,
            &config.user_agent,
        )
    }

    /// Build a client from individual settings
    pub fn with_options(
        base_url: &str,
        accept_invalid_certs: bool,
        user_agent: &str,
    ) -> Result<Self, PortalError> {
        let http = Client::builder()
            .cookie_store(true)
            .danger_accept_invalid_certs(accept_invalid_certs)
            .user_agent(user_agent)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            page: Mutex::new(None),
            navigations: watch::channel(0).0,
        })
    }

    fn url_for(&self, path: &str) -> Result<Url, PortalError> {
        let joined = format!("{}{}", self.base_url, path);
        Url::parse(&joined).map_err(|e| PortalError::InvalidUrl(format!("{}: {}", joined, e)))
    }

    /// Send `request`, make the response the current page and announce the navigation
    async fn navigate(&self, request: RequestBuilder) -> Result<String, PortalError> {
        let response = request.send().await?;
        let status = response.status();
        let url = response.url().clone();
        let content = response.text().await?;

        tracing::debug!("{} -> {} ({} bytes)", url, status, content.len());

        *self.page.lock().await = Some(Page {
            url,
            content: content.clone(),
        });
        self.navigations.send_modify(|n| *n = n.wrapping_add(1));

        Ok(content)
    }

    async fn current_page(&self) -> Result<Page, PortalError> {
        self.page.lock().await.clone().ok_or(PortalError::NoPage)
    }
}

#[async_trait]
impl PortalClient for HttpPortalClient {
    async fn fetch_page(&self, path: &str) -> Result<String, PortalError> {
        let url = self.url_for(path)?;
        self.navigate(self.http.get(url)).await
    }

    async fn wait_for_fields(&self, names: &[&str]) -> Result<(), PortalError> {
        loop {
            let page = self.current_page().await?;
            if form::has_inputs(&page.content, names) {
                return Ok(());
            }

            tokio::time::sleep(FIELD_POLL_INTERVAL).await;

            // Pages that render their form late show it on a reload
            if let Err(e) = self.navigate(self.http.get(page.url)).await {
                tracing::debug!("Reloading page while waiting for {:?}: {}", names, e);
            }
        }
    }

    async fn submit_form(&self, fields: Vec<(String, String)>) -> Result<(), PortalError> {
        let page = self.current_page().await?;
        let names: Vec<&str> = fields.iter().map(|(name, _)| name.as_str()).collect();

        let form = form::find_form(&page.content, &names)
            .ok_or_else(|| PortalError::FormNotFound(format!("no form with {:?} on {}", names, page.url)))?;

        let target = match form.action.as_deref().filter(|a| !a.trim().is_empty()) {
            Some(action) => page
                .url
                .join(action.trim())
                .map_err(|e| PortalError::InvalidUrl(format!("{}: {}", action, e)))?,
            None => page.url.clone(),
        };

        let pairs = form.submission(&fields);
        tracing::debug!("Submitting {} fields to {} ({})", pairs.len(), target, form.method);

        let request = if form.method == "post" {
            self.http.post(target).form(&pairs)
        } else {
            self.http.get(target).query(&pairs)
        };
        self.navigate(request).await.map(|_| ())
    }

    fn watch_navigation(&self) -> NavigationWatch {
        NavigationWatch::new(self.navigations.subscribe())
    }

    async fn page_content(&self) -> Result<String, PortalError> {
        self.current_page().await.map(|page| page.content)
    }

    async fn close(&self) {
        self.page.lock().await.take();
    }
}
