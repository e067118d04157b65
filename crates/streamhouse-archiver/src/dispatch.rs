//! HTTP invoker for the fan-out scheduler.
//!
//! Fires an event-type (asynchronous) invocation of the consumer function
//! through the platform's invoke API. The request is accepted as soon as
//! the platform queues it; the worker's own result is never awaited.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::debug;

use crate::config::DispatchConfig;
use crate::error::{ArchiverError, Result};
use crate::invocation::InvocationEvent;
use crate::scheduler::PartitionJob;
use crate::traits::Invoker;

/// Invoke API request body.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct InvokeRequest<'a> {
    function_name: &'a str,
    namespace: &'a str,
    qualifier: &'a str,
    invocation_type: &'static str,
    /// JSON-encoded event handed to the worker.
    client_context: String,
}

/// [`Invoker`] that POSTs to the platform invoke endpoint.
pub struct HttpInvoker {
    endpoint: String,
    token: Option<String>,
    client: Client,
}

impl HttpInvoker {
    pub fn new(endpoint: impl Into<String>, token: Option<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ArchiverError::ConnectError(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            endpoint: endpoint.into(),
            token,
            client,
        })
    }

    /// Build from dispatch settings; the endpoint is required.
    pub fn from_config(dispatch: &DispatchConfig) -> Result<Self> {
        let endpoint = dispatch.endpoint.clone().ok_or_else(|| {
            ArchiverError::ConfigError("missing required 'INVOKE_ENDPOINT'".to_string())
        })?;
        Self::new(endpoint, dispatch.token.clone(), dispatch.timeout)
    }
}

#[async_trait]
impl Invoker for HttpInvoker {
    async fn invoke(&self, job: &PartitionJob) -> Result<()> {
        let context = InvocationEvent::consume_partition(&job.partition_id);
        let body = InvokeRequest {
            function_name: &job.function_ref.name,
            namespace: &job.namespace,
            qualifier: &job.function_ref.qualifier,
            invocation_type: "Event",
            client_context: serde_json::to_string(&context)?,
        };

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            ArchiverError::DispatchError(format!(
                "invoke request for '{}' failed: {}",
                job.partition_id, e
            ))
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(ArchiverError::DispatchError(format!(
                "HTTP {} {} for '{}': {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or(""),
                job.partition_id,
                error_text
            )));
        }

        debug!(partition = %job.partition_id, "Invocation accepted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::FunctionRef;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn job() -> PartitionJob {
        PartitionJob {
            partition_id: "orders-partition-2".to_string(),
            topic_ref: "orders".to_string(),
            namespace: "default".to_string(),
            function_ref: FunctionRef {
                name: "archiver".to_string(),
                qualifier: "$LATEST".to_string(),
            },
        }
    }

    #[tokio::test]
    async fn test_invoke_posts_event_request() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/invoke"))
            .and(header("authorization", "Bearer secret-token"))
            .and(body_partial_json(serde_json::json!({
                "FunctionName": "archiver",
                "Namespace": "default",
                "Qualifier": "$LATEST",
                "InvocationType": "Event"
            })))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&mock_server)
            .await;

        let invoker = HttpInvoker::new(
            format!("{}/invoke", mock_server.uri()),
            Some("secret-token".to_string()),
            Duration::from_secs(5),
        )
        .unwrap();
        invoker.invoke(&job()).await.unwrap();

        let requests = mock_server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
        let body: serde_json::Value = requests[0].body_json().unwrap();
        let context: serde_json::Value =
            serde_json::from_str(body["ClientContext"].as_str().unwrap()).unwrap();
        assert_eq!(context["invoke_type"], "ConsumeGroupByPartition");
        assert_eq!(context["topic_partition"], "orders-partition-2");
    }

    #[tokio::test]
    async fn test_invoke_without_token_sends_no_authorization() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/invoke"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&mock_server)
            .await;

        let invoker = HttpInvoker::new(
            format!("{}/invoke", mock_server.uri()),
            None,
            Duration::from_secs(5),
        )
        .unwrap();
        invoker.invoke(&job()).await.unwrap();

        let requests = mock_server.received_requests().await.unwrap();
        assert!(!requests[0].headers.contains_key("authorization"));
    }

    #[tokio::test]
    async fn test_non_success_status_is_dispatch_error() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/invoke"))
            .respond_with(ResponseTemplate::new(503).set_body_string("throttled"))
            .mount(&mock_server)
            .await;

        let invoker = HttpInvoker::new(
            format!("{}/invoke", mock_server.uri()),
            None,
            Duration::from_secs(5),
        )
        .unwrap();

        let err = invoker.invoke(&job()).await.unwrap_err();
        assert!(
            matches!(&err, ArchiverError::DispatchError(msg) if msg.contains("503") && msg.contains("throttled"))
        );
    }

    #[test]
    fn test_from_config_requires_endpoint() {
        let dispatch = DispatchConfig {
            endpoint: None,
            token: None,
            timeout: Duration::from_secs(1),
        };
        assert!(matches!(
            HttpInvoker::from_config(&dispatch),
            Err(ArchiverError::ConfigError(_))
        ));
    }
}
