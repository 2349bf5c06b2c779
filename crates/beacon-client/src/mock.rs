//! Scriptable dispatcher for tests and offline development
//!
//! Outcomes are consumed in order; once the script is empty the
//! default outcome applies (success unless [`MockDispatcher::fail_always`]
//! was called). Every dispatched request is recorded.

use crate::client::{ApiRequest, DispatchedResponse, Dispatcher};
use crate::error::ApiError;
use crate::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

pub struct MockDispatcher {
    script: Mutex<VecDeque<Result<DispatchedResponse>>>,
    default_error: Mutex<Option<ApiError>>,
    calls: Mutex<Vec<ApiRequest>>,
}

impl MockDispatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            default_error: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
        })
    }

    /// Queue a successful response.
    pub fn push_ok(&self, status: u16, body: Value) {
        self.script
            .lock()
            .unwrap()
            .push_back(Ok(DispatchedResponse { status, body }));
    }

    /// Queue a failure.
    pub fn push_err(&self, error: ApiError) {
        self.script.lock().unwrap().push_back(Err(error));
    }

    /// Queue `times` consecutive failures.
    pub fn fail_times(&self, times: usize, error: ApiError) {
        for _ in 0..times {
            self.push_err(error.clone());
        }
    }

    /// Fail every unscripted dispatch from now on.
    pub fn fail_always(&self, error: ApiError) {
        *self.default_error.lock().unwrap() = Some(error);
    }

    pub fn calls(&self) -> Vec<ApiRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl Dispatcher for MockDispatcher {
    async fn dispatch(&self, request: &ApiRequest) -> Result<DispatchedResponse> {
        self.calls.lock().unwrap().push(request.clone());

        if let Some(outcome) = self.script.lock().unwrap().pop_front() {
            return outcome;
        }

        match self.default_error.lock().unwrap().as_ref() {
            Some(error) => Err(error.clone()),
            None => Ok(DispatchedResponse {
                status: 200,
                body: serde_json::json!({ "ok": true }),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn script_is_consumed_in_order_then_default_applies() {
        let dispatcher = MockDispatcher::new();
        dispatcher.push_err(ApiError::Network {
            message: "down".to_string(),
        });
        dispatcher.push_ok(201, serde_json::json!({"id": 9}));

        let request = ApiRequest::get("/users");
        assert!(dispatcher.dispatch(&request).await.is_err());
        assert_eq!(dispatcher.dispatch(&request).await.unwrap().status, 201);
        assert_eq!(dispatcher.dispatch(&request).await.unwrap().status, 200);
        assert_eq!(dispatcher.call_count(), 3);
    }
}
