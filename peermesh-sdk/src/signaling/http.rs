//! HTTP signaling adapter for the reference server surface.
//!
//! `push` POSTs the event JSON to `/signaling/push`; `pull` GETs
//! `/signaling/pull` with the log key and offset as query parameters. An
//! optional `waitMs` hint asks the server to hold an empty pull open briefly
//! (bounded long-poll) instead of answering `[]` immediately; the adaptive
//! backoff in the polling loops works either way.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::SignalingError;
use crate::rtc::RtcConfiguration;

use super::{LogKey, SignalingAdapter, SignalingEvent};

/// Client for the `peermesh-server` HTTP surface (or any compatible service).
pub struct HttpAdapter {
    base_url: String,
    client: reqwest::Client,
    long_poll: Option<Duration>,
    closed: AtomicBool,
    rtc: RtcConfiguration,
}

impl HttpAdapter {
    /// `base_url` is the server root, e.g. `http://127.0.0.1:8383`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
            long_poll: None,
            closed: AtomicBool::new(false),
            rtc: RtcConfiguration::default(),
        }
    }

    /// Ask the server to hold empty pulls open for up to `wait`.
    pub fn with_long_poll(mut self, wait: Duration) -> Self {
        self.long_poll = Some(wait);
        self
    }

    /// Override the RTC configuration handed to sessions.
    pub fn with_rtc_configuration(mut self, rtc: RtcConfiguration) -> Self {
        self.rtc = rtc;
        self
    }

    fn key_param(key: &LogKey) -> (&'static str, &str) {
        match key {
            LogKey::Room(id) => ("roomId", id.as_str()),
            LogKey::Channel(id) => ("channelId", id.as_str()),
        }
    }

    async fn rejection(response: reqwest::Response) -> SignalingError {
        let status = response.status().as_u16();
        #[derive(serde::Deserialize)]
        struct ErrorBody {
            error: String,
        }
        let message = match response.json::<ErrorBody>().await {
            Ok(body) => body.error,
            Err(_) => "unreadable error body".to_string(),
        };
        SignalingError::Rejected { status, message }
    }
}

#[async_trait]
impl SignalingAdapter for HttpAdapter {
    async fn push(&self, event: SignalingEvent) -> Result<(), SignalingError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SignalingError::Closed);
        }
        let response = self
            .client
            .post(format!("{}/signaling/push", self.base_url))
            .json(&event)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::rejection(response).await);
        }
        Ok(())
    }

    async fn pull(
        &self,
        key: &LogKey,
        offset_index: usize,
    ) -> Result<Vec<serde_json::Value>, SignalingError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SignalingError::Closed);
        }
        let (key_name, key_value) = Self::key_param(key);
        let offset = offset_index.to_string();
        let mut params: Vec<(&str, &str)> =
            vec![(key_name, key_value), ("offsetIndex", offset.as_str())];
        let wait_ms;
        if let Some(wait) = self.long_poll {
            wait_ms = wait.as_millis().to_string();
            params.push(("waitMs", wait_ms.as_str()));
        }
        let response = self
            .client
            .get(format!("{}/signaling/pull", self.base_url))
            .query(&params)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::rejection(response).await);
        }
        Ok(response.json().await?)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn rtc_configuration(&self) -> RtcConfiguration {
        self.rtc.clone()
    }
}
