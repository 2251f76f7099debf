//! Authenticated REST client for the notification backend.
//!
//! The bearer token lives behind a lock and is re-read on every request, so
//! `update_token` rotates credentials mid-session without tearing down the
//! active transport.

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use tracing::debug;
use url::Url;

use crate::error::{EngineError, Result};
use crate::types::{ApiResponse, Notification, NotificationPage, UnreadCountData};

/// Seam between reconciliation/transports and the HTTP layer. Tests inject
/// fakes; production uses [`ApiClient`].
#[async_trait]
pub trait NotificationFetcher: Send + Sync {
    /// Fetch the current unread count.
    async fn unread_count(&self) -> Result<u64>;

    /// Fetch the most recent page of notifications, newest first.
    async fn recent(&self, page_size: u32) -> Result<Vec<Notification>>;
}

pub struct ApiClient {
    client: Client,
    base: Url,
    token: RwLock<String>,
}

impl ApiClient {
    pub fn new(client: Client, api_url: &str) -> Result<Self> {
        let base = Url::parse(api_url)
            .map_err(|e| EngineError::invalid_url(api_url, e.to_string()))?;
        Ok(Self {
            client,
            base,
            token: RwLock::new(String::new()),
        })
    }

    /// Rotate the bearer token. Takes effect on the next request.
    pub fn update_token(&self, token: &str) {
        *self.token.write() = token.to_owned();
    }

    fn bearer(&self) -> String {
        format!("Bearer {}", self.token.read())
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        // Url::join would drop a non-slash-terminated final segment.
        let mut url = self.base.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| EngineError::invalid_url(self.base.as_str(), "cannot be a base"))?;
            segments.pop_if_empty();
            for part in path.split('/') {
                segments.push(part);
            }
        }
        Ok(url)
    }

    async fn check<T: DeserializeOwned>(
        response: Response,
        operation: &'static str,
    ) -> Result<T> {
        let status = response.status();
        if !status.is_success() {
            return Err(EngineError::from_status(status, operation));
        }
        let envelope: ApiResponse<T> = response.json().await?;
        if !envelope.success {
            return Err(EngineError::Api {
                message: envelope.message,
            });
        }
        Ok(envelope.data)
    }

    /// `GET /notifications?page&pageSize&unreadOnly`
    pub async fn notifications(
        &self,
        page: u32,
        page_size: u32,
        unread_only: bool,
    ) -> Result<NotificationPage> {
        let url = self.endpoint("notifications")?;
        let mut request = self
            .client
            .get(url)
            .header(reqwest::header::AUTHORIZATION, self.bearer())
            .query(&[("page", page.to_string()), ("pageSize", page_size.to_string())]);
        if unread_only {
            request = request.query(&[("unreadOnly", "true")]);
        }
        let response = request.send().await?;
        Self::check(response, "list notifications").await
    }

    /// `GET /notifications/unread-count`
    pub async fn fetch_unread_count(&self) -> Result<u64> {
        let url = self.endpoint("notifications/unread-count")?;
        let response = self
            .client
            .get(url)
            .header(reqwest::header::AUTHORIZATION, self.bearer())
            .send()
            .await?;
        let data: UnreadCountData = Self::check(response, "unread count").await?;
        Ok(data.count)
    }

    /// `PATCH /notifications/{id}/read`
    pub async fn mark_read(&self, id: i64) -> Result<()> {
        let url = self.endpoint(&format!("notifications/{id}/read"))?;
        let response = self
            .client
            .patch(url)
            .header(reqwest::header::AUTHORIZATION, self.bearer())
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(EngineError::from_status(status, "mark read"));
        }
        Ok(())
    }

    /// `PATCH /notifications/mark-all-read`
    pub async fn mark_all_read(&self) -> Result<()> {
        let url = self.endpoint("notifications/mark-all-read")?;
        let response = self
            .client
            .patch(url)
            .header(reqwest::header::AUTHORIZATION, self.bearer())
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(EngineError::from_status(status, "mark all read"));
        }
        Ok(())
    }

    /// `DELETE /notifications/{id}`
    pub async fn delete(&self, id: i64) -> Result<()> {
        let url = self.endpoint(&format!("notifications/{id}"))?;
        let response = self
            .client
            .delete(url)
            .header(reqwest::header::AUTHORIZATION, self.bearer())
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(EngineError::from_status(status, "delete notification"));
        }
        Ok(())
    }

    /// Open the long-lived `GET /notifications/stream` response for the
    /// stream transport. The caller owns the body read loop.
    pub async fn open_stream(&self) -> Result<Response> {
        let url = self.endpoint("notifications/stream")?;
        debug!(url = %url, "opening notification stream");
        let response = self
            .client
            .get(url)
            .header(reqwest::header::AUTHORIZATION, self.bearer())
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(EngineError::from_status(status, "open stream"));
        }
        Ok(response)
    }
}

#[async_trait]
impl NotificationFetcher for ApiClient {
    async fn unread_count(&self) -> Result<u64> {
        self.fetch_unread_count().await
    }

    async fn recent(&self, page_size: u32) -> Result<Vec<Notification>> {
        let page = self.notifications(1, page_size, false).await?;
        Ok(page.notifications)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> ApiClient {
        ApiClient::new(Client::new(), "https://example.org/api").unwrap()
    }

    #[test]
    fn endpoint_joins_without_dropping_base_path() {
        let api = client();
        let url = api.endpoint("notifications/unread-count").unwrap();
        assert_eq!(
            url.as_str(),
            "https://example.org/api/notifications/unread-count"
        );
    }

    #[test]
    fn endpoint_handles_trailing_slash_base() {
        let api = ApiClient::new(Client::new(), "https://example.org/api/").unwrap();
        let url = api.endpoint("notifications").unwrap();
        assert_eq!(url.as_str(), "https://example.org/api/notifications");
    }

    #[test]
    fn rejects_invalid_base_url() {
        assert!(ApiClient::new(Client::new(), "not a url").is_err());
    }

    #[test]
    fn token_rotation_changes_bearer() {
        let api = client();
        api.update_token("abc");
        assert_eq!(api.bearer(), "Bearer abc");
        api.update_token("def");
        assert_eq!(api.bearer(), "Bearer def");
    }
}
