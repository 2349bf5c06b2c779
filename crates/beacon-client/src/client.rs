//! API resilience engine
//!
//! [`ApiClient`] wraps a [`Dispatcher`] with three explicit stages:
//! request (correlation headers, start stamp, ingestion-endpoint
//! guard), response (cache, retry bookkeeping, slow-call flag), and
//! error (classify, log, report, recover). Recovery order on failure:
//! offline handling, auth delegation for 401s, bounded retry with
//! backoff, stale-cache fallback for GETs. Anything unrecovered
//! reaches the caller as the original error.

use crate::cache::ResponseCache;
use crate::config::ClientConfig;
use crate::error::ApiError;
use crate::offline::OfflineQueue;
use crate::recovery::{AuthOutcome, AuthRecovery, RetryLedger};
use crate::Result;
use async_trait::async_trait;
use beacon_core::{ContextManager, StateStore};
use beacon_telemetry::{classify, Classification, ExceptionContext, ExceptionReporter, LogLayer, Logger};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const TRACE_HEADER: &str = "X-Trace-Id";
pub const REQUEST_HEADER: &str = "X-Request-Id";

/// One outbound call. Cheap to clone; retries and offline replay
/// re-dispatch the same value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiRequest {
    pub method: String,
    pub url: String,
    pub params: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    pub headers: BTreeMap<String, String>,
}

impl ApiRequest {
    pub fn new(method: &str, url: &str) -> Self {
        Self {
            method: method.to_uppercase(),
            url: url.to_string(),
            params: BTreeMap::new(),
            body: None,
            headers: BTreeMap::new(),
        }
    }

    pub fn get(url: &str) -> Self {
        Self::new("GET", url)
    }

    pub fn post(url: &str, body: Value) -> Self {
        let mut request = Self::new("POST", url);
        request.body = Some(body);
        request
    }

    pub fn put(url: &str, body: Value) -> Self {
        let mut request = Self::new("PUT", url);
        request.body = Some(body);
        request
    }

    pub fn delete(url: &str) -> Self {
        Self::new("DELETE", url)
    }

    pub fn with_param(mut self, key: &str, value: &str) -> Self {
        self.params.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_header(mut self, key: &str, value: &str) -> Self {
        self.headers.insert(key.to_string(), value.to_string());
        self
    }

    pub fn is_get(&self) -> bool {
        self.method == "GET"
    }

    /// Cache/bookkeeping key: method, url, serialized params. BTreeMap
    /// ordering makes the serialization deterministic.
    pub fn cache_key(&self) -> String {
        let mut key = format!("{} {}", self.method, self.url);
        if !self.params.is_empty() {
            key.push('?');
            let mut first = true;
            for (name, value) in &self.params {
                if !first {
                    key.push('&');
                }
                key.push_str(name);
                key.push('=');
                key.push_str(value);
                first = false;
            }
        }
        key
    }
}

/// Raw outcome of a dispatch, before the response stage runs.
#[derive(Debug, Clone)]
pub struct DispatchedResponse {
    pub status: u16,
    pub body: Value,
}

/// Resolved call, after caching/recovery decorations.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
    pub from_cache: bool,
    pub is_stale: bool,
    pub request_id: Option<String>,
}

/// The underlying HTTP client seam. Must resolve non-2xx statuses as
/// errors so the error stage sees them, and must accept a request
/// value produced by the error stage for re-dispatch.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, request: &ApiRequest) -> Result<DispatchedResponse>;
}

/// Real dispatcher on a configured `reqwest` client.
pub struct ReqwestDispatcher {
    client: reqwest::Client,
    base_url: String,
}

impl ReqwestDispatcher {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| ApiError::Dispatch {
                message: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            client,
            base_url: config.base_url.clone(),
        })
    }

    fn absolute_url(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else {
            format!("{}/{}", self.base_url.trim_end_matches('/'), url.trim_start_matches('/'))
        }
    }
}

#[async_trait]
impl Dispatcher for ReqwestDispatcher {
    async fn dispatch(&self, request: &ApiRequest) -> Result<DispatchedResponse> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes()).map_err(|_| {
            ApiError::Dispatch {
                message: format!("invalid HTTP method: {}", request.method),
            }
        })?;

        let mut builder = self
            .client
            .request(method, self.absolute_url(&request.url))
            .query(&request.params);

        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }

        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                ApiError::Timeout { timeout_ms: 0 }
            } else {
                ApiError::from(e)
            }
        })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .ok()
            .and_then(|text| serde_json::from_str(&text).ok())
            .unwrap_or(Value::Null);

        if status.is_success() {
            Ok(DispatchedResponse {
                status: status.as_u16(),
                body,
            })
        } else {
            Err(ApiError::Http {
                status: status.as_u16(),
                message: status
                    .canonical_reason()
                    .unwrap_or("HTTP error")
                    .to_string(),
                body,
            })
        }
    }
}

/// The resilience engine. One instance per application, created at
/// startup and shut down on exit.
pub struct ApiClient {
    config: ClientConfig,
    context: Arc<ContextManager>,
    logger: Arc<Logger>,
    exceptions: Arc<ExceptionReporter>,
    dispatcher: Arc<dyn Dispatcher>,
    auth: Option<Arc<dyn AuthRecovery>>,
    cache: Arc<ResponseCache>,
    offline_queue: Arc<OfflineQueue>,
    ledger: RetryLedger,
    online: AtomicBool,
    cancel: CancellationToken,
}

impl ApiClient {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ClientConfig,
        context: Arc<ContextManager>,
        logger: Arc<Logger>,
        exceptions: Arc<ExceptionReporter>,
        dispatcher: Arc<dyn Dispatcher>,
        auth: Option<Arc<dyn AuthRecovery>>,
        store: Option<Arc<dyn StateStore>>,
    ) -> Self {
        let cancel = CancellationToken::new();

        let cache = Arc::new(ResponseCache::new(config.cache.clone(), store.clone()));
        cache.spawn_sweeper(cancel.clone());

        let offline_queue = Arc::new(OfflineQueue::new(config.offline.clone(), store));

        Self {
            config,
            context,
            logger,
            exceptions,
            dispatcher,
            auth,
            cache,
            offline_queue,
            ledger: RetryLedger::new(),
            online: AtomicBool::new(true),
            cancel,
        }
    }

    /// Run one call through the three stages.
    pub async fn execute(&self, request: ApiRequest) -> Result<ApiResponse> {
        let mut request = request;
        let skip_logging = self.is_ingestion_call(&request);

        // Request stage: correlation headers and start stamp.
        let request_id = if skip_logging {
            None
        } else {
            Some(self.context.next_request_id())
        };
        request
            .headers
            .insert(TRACE_HEADER.to_string(), self.context.trace_id());
        if let Some(id) = &request_id {
            request.headers.insert(REQUEST_HEADER.to_string(), id.clone());
        }

        let key = request.cache_key();
        let started = Instant::now();

        if !self.is_online() {
            if request.is_get() {
                if let Some(entry) = self.cache.get_fresh(&key) {
                    if !skip_logging {
                        self.logger.info(
                            LogLayer::Service,
                            "offline, serving cached response",
                            Some(serde_json::json!({ "url": request.url })),
                        );
                    }
                    return Ok(ApiResponse {
                        status: entry.status,
                        body: entry.body,
                        from_cache: true,
                        is_stale: false,
                        request_id,
                    });
                }
                // No fresh cache: fall through to dispatch so the error
                // stage owns the stale-fallback decision.
            } else {
                return Err(self.queue_offline_write(request, skip_logging));
            }
        }

        match self.dispatcher.dispatch(&request).await {
            Ok(raw) => Ok(self.accept(&request, raw, request_id, started, skip_logging)),
            Err(error) => {
                self.handle_error(request, key, error, request_id, started, skip_logging)
                    .await
            }
        }
    }

    /// Connectivity signal. The offline -> online transition replays
    /// the queued writes in the background.
    pub fn set_online(&self, online: bool) {
        let was_online = self.online.swap(online, Ordering::SeqCst);
        if online && !was_online {
            info!(queued = self.offline_queue.len(), "connectivity restored");
            let queue = Arc::clone(&self.offline_queue);
            let dispatcher = Arc::clone(&self.dispatcher);
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    outcome = queue.replay(&dispatcher) => {
                        info!(
                            replayed = outcome.replayed,
                            skipped = outcome.skipped_stale,
                            dropped = outcome.dropped,
                            "offline queue replay finished"
                        );
                    }
                }
            });
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    pub fn offline_queue(&self) -> &Arc<OfflineQueue> {
        &self.offline_queue
    }

    pub fn retry_ledger(&self) -> &RetryLedger {
        &self.ledger
    }

    /// Cancel the background tasks. Call at application shutdown.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    // Response stage.
    fn accept(
        &self,
        request: &ApiRequest,
        raw: DispatchedResponse,
        request_id: Option<String>,
        started: Instant,
        skip_logging: bool,
    ) -> ApiResponse {
        let key = request.cache_key();

        if request.is_get() {
            self.cache.insert(&key, raw.status, raw.body.clone());
        }
        self.ledger.recovered(&key);

        let duration = started.elapsed();
        if !skip_logging {
            if duration > self.config.slow_call_threshold() {
                self.logger.warn(
                    LogLayer::Performance,
                    "slow api call",
                    Some(serde_json::json!({
                        "method": request.method,
                        "url": request.url,
                        "duration_ms": duration.as_millis() as u64,
                    })),
                );
            }

            self.logger.debug(
                LogLayer::Service,
                "api call succeeded",
                Some(serde_json::json!({
                    "method": request.method,
                    "url": request.url,
                    "status": raw.status,
                    "duration_ms": duration.as_millis() as u64,
                })),
            );
        }

        ApiResponse {
            status: raw.status,
            body: raw.body,
            from_cache: false,
            is_stale: false,
            request_id,
        }
    }

    // Error stage.
    async fn handle_error(
        &self,
        request: ApiRequest,
        key: String,
        error: ApiError,
        request_id: Option<String>,
        started: Instant,
        skip_logging: bool,
    ) -> Result<ApiResponse> {
        let classification = classify(&error.failure_kind());

        if !skip_logging {
            self.logger.error(
                LogLayer::Service,
                "api call failed",
                Some(serde_json::json!({
                    "method": request.method,
                    "url": request.url,
                    "category": classification.category.as_str(),
                    "error": error.to_string(),
                })),
            );
            self.report_failure(&error, &request, classification);
        }

        let offline = !self.is_online();
        if !self.config.recovery.enabled || (!classification.recoverable && !offline) {
            return Err(error);
        }

        // A write that failed because connectivity dropped mid-flight
        // joins the offline queue like any other offline write.
        if offline && !request.is_get() {
            return Err(self.queue_offline_write(request, skip_logging));
        }

        if classification.category == beacon_telemetry::ErrorCategory::AuthenticationError {
            return self
                .recover_auth(error, request, request_id, started, skip_logging)
                .await;
        }

        if classification.retryable {
            return self
                .retry_with_backoff(request, key, error, request_id, started, skip_logging)
                .await;
        }

        Err(error)
    }

    /// Bounded retry per request key; GET exhaustion falls back to any
    /// cached entry, explicitly flagged stale.
    async fn retry_with_backoff(
        &self,
        request: ApiRequest,
        key: String,
        original: ApiError,
        request_id: Option<String>,
        started: Instant,
        skip_logging: bool,
    ) -> Result<ApiResponse> {
        let mut attempts = 1usize;

        while attempts < self.config.recovery.max_attempts {
            let delay = self.config.recovery.retry_delay(attempts - 1);
            tokio::time::sleep(delay).await;

            let retry_number = self.ledger.record_retry(&key);
            attempts += 1;
            debug!(
                key = %key,
                retry = retry_number,
                attempt = attempts,
                "retrying api call"
            );

            match self.dispatcher.dispatch(&request).await {
                Ok(raw) => {
                    return Ok(self.accept(&request, raw, request_id, started, skip_logging));
                }
                Err(error) => {
                    debug!(key = %key, attempt = attempts, %error, "retry failed");
                }
            }
        }

        self.ledger.exhausted(&key);

        if request.is_get() {
            if let Some(entry) = self.cache.get_any(&key) {
                if !skip_logging {
                    self.logger.warn(
                        LogLayer::Service,
                        "retries exhausted, serving stale cached response",
                        Some(serde_json::json!({ "url": request.url })),
                    );
                }
                return Ok(ApiResponse {
                    status: entry.status,
                    body: entry.body,
                    from_cache: true,
                    is_stale: true,
                    request_id,
                });
            }
        }

        Err(original)
    }

    /// Delegate a 401 to the auth collaborator. Whatever happens, the
    /// caller gets a resolution, not a rejection.
    async fn recover_auth(
        &self,
        error: ApiError,
        request: ApiRequest,
        request_id: Option<String>,
        started: Instant,
        skip_logging: bool,
    ) -> Result<ApiResponse> {
        let Some(auth) = &self.auth else {
            return Ok(self.auth_failed_response(request_id));
        };

        match auth.recover(&error, &request).await {
            AuthOutcome::Retry(retry_request) => {
                match self.dispatcher.dispatch(&retry_request).await {
                    Ok(raw) => {
                        Ok(self.accept(&retry_request, raw, request_id, started, skip_logging))
                    }
                    Err(retry_error) => {
                        warn!(%retry_error, "retry after auth recovery failed");
                        Ok(self.auth_failed_response(request_id))
                    }
                }
            }
            AuthOutcome::Fallback(response) => Ok(response),
            AuthOutcome::Unrecoverable => Ok(self.auth_failed_response(request_id)),
        }
    }

    fn auth_failed_response(&self, request_id: Option<String>) -> ApiResponse {
        ApiResponse {
            status: 401,
            body: serde_json::json!({
                "auth_failed": true,
                "message": "authentication failed",
            }),
            from_cache: false,
            is_stale: false,
            request_id,
        }
    }

    fn queue_offline_write(&self, request: ApiRequest, skip_logging: bool) -> ApiError {
        if !skip_logging {
            self.logger.info(
                LogLayer::Service,
                "offline, queueing write for replay",
                Some(serde_json::json!({
                    "method": request.method,
                    "url": request.url,
                })),
            );
        }
        let queued_at_ms = self.offline_queue.enqueue(request);
        ApiError::Queued { queued_at_ms }
    }

    /// Fire-and-forget report into the exception pipeline.
    fn report_failure(
        &self,
        error: &ApiError,
        request: &ApiRequest,
        classification: Classification,
    ) {
        let reporter = Arc::clone(&self.exceptions);
        let name = error.name();
        let message = error.to_string();
        let context = ExceptionContext {
            url: Some(request.url.clone()),
            method: Some(request.method.clone()),
            extra: None,
        };
        tokio::spawn(async move {
            reporter.report_parts(name, &message, None, context, Some(classification));
        });
    }

    fn is_ingestion_call(&self, request: &ApiRequest) -> bool {
        self.config
            .ingestion_urls
            .iter()
            .any(|url| request.url.starts_with(url) || url.ends_with(&request.url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_key_is_deterministic_over_params() {
        let a = ApiRequest::get("/users")
            .with_param("page", "2")
            .with_param("filter", "active");
        let b = ApiRequest::get("/users")
            .with_param("filter", "active")
            .with_param("page", "2");

        assert_eq!(a.cache_key(), b.cache_key());
        assert_eq!(a.cache_key(), "GET /users?filter=active&page=2");
    }

    #[test]
    fn method_is_normalized_uppercase() {
        let request = ApiRequest::new("post", "/orders");
        assert_eq!(request.method, "POST");
        assert!(!request.is_get());
        assert!(ApiRequest::get("/orders").is_get());
    }

    #[test]
    fn absolute_url_joins_relative_paths() {
        let dispatcher = ReqwestDispatcher::new(&ClientConfig::default()).unwrap();
        assert_eq!(
            dispatcher.absolute_url("/api/users"),
            "http://localhost:8000/api/users"
        );
        assert_eq!(
            dispatcher.absolute_url("https://other.example/x"),
            "https://other.example/x"
        );
    }
}
