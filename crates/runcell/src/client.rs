//! Jupyter Server REST client for one remote kernel.
//!
//! Lifecycle calls (start, interrupt, restart, shutdown, status) go over
//! HTTP; execution goes over the channels WebSocket owned by this client.
//! The kernels API path is discovered once, on construction, by probing a
//! fixed list of candidates and keeping the first that answers.

use std::time::{Duration, Instant};

use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use url::Url;

use crate::channels::KernelChannels;
use crate::error::{KernelError, Result};
use crate::message::OutgoingMessage;

const DEFAULT_API_PATH: &str = "/api/kernels";

/// Connection options, usually derived from [`crate::settings::Settings`].
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub probe_timeout: Duration,
    pub accept_invalid_certs: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_secs(5),
            accept_invalid_certs: true,
        }
    }
}

impl From<&crate::settings::Settings> for ClientOptions {
    fn from(settings: &crate::settings::Settings) -> Self {
        Self {
            probe_timeout: settings.probe_timeout(),
            accept_invalid_certs: settings.accept_invalid_certs,
        }
    }
}

/// Kernel model returned by `GET /api/kernels/<id>`.
#[derive(Debug, Clone, Deserialize)]
pub struct KernelModel {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub execution_state: Option<String>,
}

/// Ordered, de-duplicated API path candidates for a server URL path.
pub fn candidate_paths(url_path: &str) -> Vec<String> {
    let path = url_path.trim_end_matches('/');
    let parent = if url_path.matches('/').count() > 1 {
        let mut segments: Vec<&str> = url_path.split('/').collect();
        segments.pop();
        format!("{}{}", segments.join("/").trim_end_matches('/'), DEFAULT_API_PATH)
    } else {
        DEFAULT_API_PATH.to_string()
    };

    let mut candidates: Vec<String> = Vec::with_capacity(4);
    for candidate in [
        DEFAULT_API_PATH.to_string(),
        format!("/user/anonymous{}", DEFAULT_API_PATH),
        format!("{}{}", path, DEFAULT_API_PATH),
        parent,
    ] {
        if !candidates.contains(&candidate) {
            candidates.push(candidate);
        }
    }
    candidates
}

/// Token carried in the URL's query string, if any.
pub fn token_from_url(url: &Url) -> Option<String> {
    url.query_pairs()
        .find(|(key, _)| key == "token")
        .map(|(_, value)| value.into_owned())
        .filter(|token| !token.is_empty())
}

#[derive(Debug)]
pub struct KernelClient {
    http: Client,
    /// Scheme, host and port only.
    origin: Url,
    api_path: String,
    token: Option<String>,
    kernel_name: String,
    kernel_id: Option<String>,
    session_id: String,
    channels: Option<KernelChannels>,
}

impl KernelClient {
    /// Parse `server_url`, extract its token and discover the kernels API path.
    pub async fn connect(
        server_url: &str,
        kernel_name: &str,
        options: &ClientOptions,
    ) -> Result<Self> {
        let url = Url::parse(server_url)?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(KernelError::Connection(format!(
                "unsupported URL scheme '{}'",
                url.scheme()
            )));
        }
        let token = token_from_url(&url);

        let mut origin = url.clone();
        origin.set_path("");
        origin.set_query(None);
        origin.set_fragment(None);

        let http = Client::builder()
            .danger_accept_invalid_certs(options.accept_invalid_certs)
            .build()?;

        let mut client = Self {
            http,
            origin,
            api_path: DEFAULT_API_PATH.to_string(),
            token,
            kernel_name: kernel_name.to_string(),
            kernel_id: None,
            session_id: uuid::Uuid::new_v4().to_string(),
            channels: None,
        };
        client.api_path = client
            .discover_api_path(url.path(), options.probe_timeout)
            .await;
        Ok(client)
    }

    async fn discover_api_path(&self, url_path: &str, probe_timeout: Duration) -> String {
        for candidate in candidate_paths(url_path) {
            let url = match self.endpoint(&candidate) {
                Ok(url) => url,
                Err(_) => continue,
            };
            let request = self.authorize(self.http.get(url)).timeout(probe_timeout);
            match request.send().await {
                Ok(response) if response.status() == StatusCode::OK => {
                    log::info!("[kernel-client] Using kernels API at {}", candidate);
                    return candidate;
                }
                Ok(response) => {
                    log::debug!(
                        "[kernel-client] Probe {} answered {}",
                        candidate,
                        response.status()
                    );
                }
                Err(e) => log::debug!("[kernel-client] Probe {} failed: {}", candidate, e),
            }
        }
        log::warn!(
            "[kernel-client] No kernels API candidate answered, falling back to {}",
            DEFAULT_API_PATH
        );
        DEFAULT_API_PATH.to_string()
    }

    pub fn api_path(&self) -> &str {
        &self.api_path
    }

    pub fn kernel_name(&self) -> &str {
        &self.kernel_name
    }

    pub fn kernel_id(&self) -> Option<&str> {
        self.kernel_id.as_deref()
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn has_channels(&self) -> bool {
        self.channels.is_some()
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        Ok(self.origin.join(path)?)
    }

    fn kernel_url(&self, suffix: &str) -> Result<Url> {
        let id = self
            .kernel_id
            .as_deref()
            .ok_or_else(|| KernelError::KernelNotFound("kernel has not been started".into()))?;
        self.endpoint(&format!("{}/{}{}", self.api_path, id, suffix))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => {
                request.header(reqwest::header::AUTHORIZATION, format!("token {}", token))
            }
            None => request,
        }
    }

    async fn check(response: Response, action: &str) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(KernelError::Connection(format!(
            "{} failed: HTTP {}: {}",
            action,
            status,
            body.chars().take(200).collect::<String>()
        )))
    }

    /// Create the kernel and remember its id.
    pub async fn start(&mut self) -> Result<String> {
        let url = self.endpoint(&self.api_path)?;
        log::info!("[kernel-client] Starting {} kernel at {}", self.kernel_name, url);

        let response = self
            .authorize(self.http.post(url))
            .json(&json!({ "name": self.kernel_name }))
            .send()
            .await?;
        let response = Self::check(response, "start kernel").await?;
        let body = response.text().await?;
        let model: KernelModel = serde_json::from_str(&body).map_err(|e| {
            KernelError::Protocol(format!(
                "invalid kernel model {}: {}",
                body.chars().take(200).collect::<String>(),
                e
            ))
        })?;

        log::info!("[kernel-client] Kernel started: {}", model.id);
        self.kernel_id = Some(model.id.clone());
        Ok(model.id)
    }

    /// WebSocket URL for the kernel's channels: `wss` iff the server is `https`.
    pub fn channels_url(&self) -> Result<Url> {
        let mut url = self.kernel_url("/channels")?;
        let scheme = if self.origin.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| KernelError::Connection(format!("cannot use {} for {}", scheme, url)))?;
        url.query_pairs_mut()
            .append_pair("session_id", &self.session_id);
        Ok(url)
    }

    pub async fn start_channels(&mut self) -> Result<()> {
        let url = self.channels_url()?;
        let channels = KernelChannels::connect(&url, self.token.as_deref()).await?;
        self.channels = Some(channels);
        Ok(())
    }

    pub fn stop_channels(&mut self) {
        if let Some(mut channels) = self.channels.take() {
            channels.close();
        }
    }

    fn channels(&self) -> Result<&KernelChannels> {
        self.channels
            .as_ref()
            .ok_or_else(|| KernelError::KernelDead("channels are not open".into()))
    }

    fn channels_mut(&mut self) -> Result<&mut KernelChannels> {
        self.channels
            .as_mut()
            .ok_or_else(|| KernelError::KernelDead("channels are not open".into()))
    }

    /// Queue an `execute_request`. Returns its `msg_id` without waiting.
    pub fn execute(&self, code: &str) -> Result<String> {
        let message = OutgoingMessage::execute_request(code, &self.session_id)?;
        self.channels()?.send(&message)?;
        Ok(message.msg_id().to_string())
    }

    pub fn send_input_reply(&self, text: &str) -> Result<()> {
        let message = OutgoingMessage::input_reply(text, &self.session_id);
        self.channels()?.send(&message)
    }

    /// Non-blocking. `Ok(None)` when nothing is queued.
    pub fn get_iopub_msg(&mut self) -> Result<Option<Value>> {
        self.channels_mut()?.try_recv_iopub()
    }

    pub fn get_stdin_msg(&mut self) -> Result<Option<Value>> {
        self.channels_mut()?.try_recv_stdin()
    }

    pub async fn interrupt(&self) -> Result<()> {
        let url = self.kernel_url("/interrupt")?;
        log::info!("[kernel-client] Interrupting kernel {}", url);
        let response = self.authorize(self.http.post(url)).send().await?;
        Self::check(response, "interrupt").await?;
        Ok(())
    }

    pub async fn restart(&self) -> Result<()> {
        let url = self.kernel_url("/restart")?;
        log::info!("[kernel-client] Restarting kernel {}", url);
        let response = self.authorize(self.http.post(url)).send().await?;
        Self::check(response, "restart").await?;
        Ok(())
    }

    /// DELETE the kernel. The client forgets the kernel id either way.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.stop_channels();
        let url = match self.kernel_url("") {
            Ok(url) => url,
            Err(_) => return Ok(()),
        };
        self.kernel_id = None;
        log::info!("[kernel-client] Shutting down kernel {}", url);
        let response = self.authorize(self.http.delete(url)).send().await?;
        Self::check(response, "shutdown").await?;
        Ok(())
    }

    pub async fn status(&self) -> Result<KernelModel> {
        let url = self.kernel_url("")?;
        let response = self.authorize(self.http.get(url)).send().await?;
        let response = Self::check(response, "kernel status").await?;
        Ok(response.json::<KernelModel>().await?)
    }

    /// Poll the kernel model until it reports `idle`, discarding any queued
    /// messages along the way. Fails with `Timeout` once `timeout` has passed.
    pub async fn wait_for_ready(
        &mut self,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<()> {
        let started = Instant::now();
        loop {
            let model = self.status().await?;
            if let Some(channels) = self.channels.as_mut() {
                let discarded = channels.drain();
                if discarded > 0 {
                    log::debug!("[kernel-client] Discarded {} stale messages", discarded);
                }
            }

            let state = model.execution_state.as_deref().unwrap_or("unknown");
            if state == "idle" {
                return Ok(());
            }

            let elapsed = started.elapsed();
            if elapsed >= timeout {
                log::warn!(
                    "[kernel-client] Kernel still '{}' after {:?}",
                    state,
                    elapsed
                );
                return Err(KernelError::Timeout(timeout));
            }
            tokio::time::sleep(poll_interval.min(timeout - elapsed)).await;
        }
    }

    #[cfg(test)]
    pub(crate) fn detached(kernel_id: &str, channels: KernelChannels) -> Self {
        let origin = Url::parse("http://127.0.0.1:9").unwrap();
        Self {
            http: Client::new(),
            origin,
            api_path: DEFAULT_API_PATH.to_string(),
            token: None,
            kernel_name: "python3".to_string(),
            kernel_id: Some(kernel_id.to_string()),
            session_id: "test-session".to_string(),
            channels: Some(channels),
        }
    }
}
