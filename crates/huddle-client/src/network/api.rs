use anyhow::Result;
use async_trait::async_trait;
use huddle_scheduler::{Executor, NetworkRequest, Priority, RequestScheduler, Route, TaskId};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;

use crate::config::ApiSettings;

/// One HTTP call queued through the request scheduler
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub route: Route,
    pub priority: Priority,
    pub method: Method,
    pub path: String,
    pub body: Option<Value>,
    pub token: Option<String>,
}

impl ApiRequest {
    pub fn new(route: impl Into<Route>, method: Method, path: impl Into<String>) -> Self {
        Self {
            route: route.into(),
            priority: Priority::Normal,
            method,
            path: path.into(),
            body: None,
            token: None,
        }
    }

    pub fn get(route: impl Into<Route>, path: impl Into<String>) -> Self {
        Self::new(route, Method::GET, path)
    }

    pub fn post(route: impl Into<Route>, path: impl Into<String>, body: Value) -> Self {
        Self::new(route, Method::POST, path).with_body(body)
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }
}

impl NetworkRequest for ApiRequest {
    type Output = Result<Value>;

    fn route(&self) -> Route {
        self.route.clone()
    }

    fn priority(&self) -> Priority {
        self.priority
    }
}

/// Performs [`ApiRequest`]s with reqwest
pub struct ApiExecutor {
    client: reqwest::Client,
    base_url: String,
}

impl ApiExecutor {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl Executor<ApiRequest> for ApiExecutor {
    async fn execute(&self, request: Arc<ApiRequest>) -> Result<Value> {
        let url = format!("{}{}", self.base_url, request.path);
        let mut builder = self.client.request(request.method.clone(), &url);

        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        if let Some(token) = &request.token {
            builder = builder.header("Authorization", format!("Bearer {}", token));
        }

        let response = builder.send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("Request failed with status {}: {}", status, text);
        }

        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// HTTP API client whose calls go through a [`RequestScheduler`]
#[derive(Clone)]
pub struct ApiClient {
    scheduler: RequestScheduler<ApiRequest>,
    token: Option<String>,
}

impl ApiClient {
    /// Returns `None` when no base URL is configured
    pub fn from_settings(settings: &ApiSettings) -> Option<Self> {
        let base_url = settings.base_url.as_deref()?;
        let executor = Arc::new(ApiExecutor::new(base_url));
        let scheduler = RequestScheduler::new(settings.weights);
        for route in &settings.routes {
            scheduler.add_route(Route::new(&route.name), route.concurrency, executor.clone());
        }
        tracing::debug!(%base_url, routes = settings.routes.len(), "API client ready");

        Some(Self {
            scheduler,
            token: settings.token.clone(),
        })
    }

    pub fn scheduler(&self) -> &RequestScheduler<ApiRequest> {
        &self.scheduler
    }

    fn authorize(&self, request: ApiRequest) -> ApiRequest {
        match (&request.token, &self.token) {
            (None, Some(token)) => request.with_token(Some(token.clone())),
            _ => request,
        }
    }

    pub async fn send(&self, request: ApiRequest) -> Result<Value> {
        self.scheduler.submit(self.authorize(request), true).await?
    }

    pub async fn send_as<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T> {
        Ok(serde_json::from_value(self.send(request).await?)?)
    }

    /// Queue without waiting; the outcome goes to `on_complete`
    pub fn enqueue(
        &self,
        request: ApiRequest,
        on_complete: impl FnOnce(Result<Value>) + Send + 'static,
    ) -> TaskId {
        self.scheduler
            .add_request(self.authorize(request), true, move |result| {
                on_complete(result.map_err(anyhow::Error::from).and_then(|r| r))
            })
    }

    pub fn cancel(&self, id: TaskId) -> bool {
        self.scheduler.cancel_request(id)
    }

    pub fn shutdown(&self) {
        self.scheduler.shutdown();
    }
}
