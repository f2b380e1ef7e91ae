//! HTTP-backed collaborators.

use crate::batch::{BatchResponse, BatchSink, WorkItem};
use crate::collaborators::{
    Broadcaster, Execution, SearchIndex, Subscriber, TextGenerator, WorkflowStarter,
};
use crate::config::BasicAuth;
use crate::errors::{DeliveryError, PipelineError, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use url::Url;

pub fn http_client(timeout: Duration) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder().timeout(timeout).build()?)
}

fn join(base: &Url, path: &str) -> String {
    format!("{}/{}", base.as_str().trim_end_matches('/'), path)
}

/// Appends `segments` to `base`, percent-encoding each one so a `/` stays inside its segment.
fn with_segments(base: &Url, segments: &[&str]) -> Result<Url> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| PipelineError::Configuration(format!("{base} cannot take a path")))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

#[derive(Serialize)]
struct BatchEntry<'a> {
    id: &'a str,
    body: &'a str,
}

#[derive(Serialize)]
struct BatchRequest<'a> {
    entries: Vec<BatchEntry<'a>>,
}

/// Queue or bus endpoint accepting `{"entries": [{"id", "body"}]}`.
pub struct HttpBatchSink {
    name: &'static str,
    client: reqwest::Client,
    url: Url,
}

impl HttpBatchSink {
    pub fn new(name: &'static str, client: reqwest::Client, url: Url) -> Self {
        Self { name, client, url }
    }
}

#[async_trait]
impl BatchSink for HttpBatchSink {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn submit_batch(&self, entries: &[WorkItem]) -> Result<BatchResponse> {
        let request = BatchRequest {
            entries: entries
                .iter()
                .map(|e| BatchEntry {
                    id: &e.item_id,
                    body: &e.payload,
                })
                .collect(),
        };

        let response = self
            .client
            .post(self.url.clone())
            .json(&request)
            .send()
            .await
            .map_err(|e| PipelineError::TransientSink(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::TransientSink(format!(
                "{} responded with {status}",
                self.name
            )));
        }

        response
            .json::<BatchResponse>()
            .await
            .map_err(|e| PipelineError::TransientSink(format!("unreadable response: {e}")))
    }
}

#[derive(Serialize)]
struct StartExecution<'a> {
    name: &'a str,
    input: &'a str,
}

/// Workflow service exposing `POST /state-machines/{name}/executions`.
pub struct HttpWorkflowStarter {
    client: reqwest::Client,
    url: Url,
    state_machine: String,
}

impl HttpWorkflowStarter {
    pub fn new(client: reqwest::Client, url: Url, state_machine: String) -> Self {
        Self {
            client,
            url,
            state_machine,
        }
    }
}

#[async_trait]
impl WorkflowStarter for HttpWorkflowStarter {
    async fn start(&self, execution_name: &str, input: &str) -> Result<Execution> {
        let url = with_segments(
            &self.url,
            &["state-machines", self.state_machine.as_str(), "executions"],
        )?;
        let response = self
            .client
            .post(url)
            .json(&StartExecution {
                name: execution_name,
                input,
            })
            .send()
            .await
            .map_err(|e| PipelineError::TransientSink(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::TransientSink(format!(
                "starting {} responded with {status}",
                self.state_machine
            )));
        }
        Ok(response.json::<Execution>().await?)
    }
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

/// Text generation service speaking the `/api/generate` protocol.
pub struct HttpTextGenerator {
    client: reqwest::Client,
    url: Url,
    model: String,
}

impl HttpTextGenerator {
    pub fn new(client: reqwest::Client, url: Url, model: String) -> Self {
        Self { client, url, model }
    }
}

#[async_trait]
impl TextGenerator for HttpTextGenerator {
    fn model(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str) -> Result<String> {
        let response = self
            .client
            .post(join(&self.url, "api/generate"))
            .json(&GenerateRequest {
                model: &self.model,
                prompt,
                stream: false,
            })
            .send()
            .await
            .map_err(|e| PipelineError::Generation(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::Generation(format!(
                "model {} responded with {status}",
                self.model
            )));
        }

        let body = response
            .json::<GenerateResponse>()
            .await
            .map_err(|e| PipelineError::Generation(format!("unreadable response: {e}")))?;
        Ok(body.response)
    }
}

/// Search engine exposing `PUT /{index}/_doc/{id}`.
pub struct HttpSearchIndex {
    client: reqwest::Client,
    endpoint: Url,
    auth: Option<BasicAuth>,
}

impl HttpSearchIndex {
    pub fn new(client: reqwest::Client, endpoint: Url, auth: Option<BasicAuth>) -> Self {
        Self {
            client,
            endpoint,
            auth,
        }
    }
}

#[async_trait]
impl SearchIndex for HttpSearchIndex {
    async fn put_document(&self, index: &str, doc_id: &str, document: &Value) -> Result<()> {
        let url = join(&self.endpoint, &format!("{index}/_doc/{doc_id}"));
        let mut request = self.client.put(&url).json(document);
        if let Some(auth) = &self.auth {
            request = request.basic_auth(&auth.username, Some(&auth.password));
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::CollaboratorUnavailable(format!(
                "indexing {doc_id} into {index} returned {status}"
            )));
        }
        tracing::debug!(index, doc_id, "Indexed document");
        Ok(())
    }
}

/// Delivers notifications by POSTing them to each subscriber's endpoint.
pub struct WebhookBroadcaster {
    client: reqwest::Client,
}

impl WebhookBroadcaster {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Broadcaster for WebhookBroadcaster {
    async fn deliver(
        &self,
        subscriber: &Subscriber,
        notification: &Value,
    ) -> std::result::Result<(), DeliveryError> {
        let response = self
            .client
            .post(&subscriber.endpoint)
            .json(notification)
            .send()
            .await
            .map_err(|e| DeliveryError::Failed(e.to_string()))?;

        match response.status() {
            StatusCode::NOT_FOUND | StatusCode::GONE => Err(DeliveryError::Gone),
            status if status.is_success() => Ok(()),
            status => Err(DeliveryError::Failed(format!("endpoint returned {status}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::TestServer;
    use hyper::Method;
    use serde_json::json;

    fn client() -> reqwest::Client {
        http_client(Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_batch_sink() {
        let server = TestServer::spawn(|_, _, body| {
            let request: Value = serde_json::from_slice(body).unwrap();
            let entries = request["entries"].as_array().unwrap();
            assert_eq!(entries[0]["body"], "hello");
            (
                StatusCode::OK,
                json!({
                    "successful": [{"id": "a", "sink_id": "q-1"}],
                    "failed": [{"id": "b", "reason": "throttled"}]
                })
                .to_string(),
            )
        })
        .await;

        let sink = HttpBatchSink::new("queue", client(), server.url(""));
        let response = sink
            .submit_batch(&[WorkItem::new("a", "hello"), WorkItem::new("b", "world")])
            .await
            .unwrap();
        assert_eq!(response.successful[0].sink_id.as_deref(), Some("q-1"));
        assert_eq!(response.failed[0].id, "b");
        assert_eq!(server.requests()[0].method, Method::POST);
    }

    #[tokio::test]
    async fn test_batch_sink_error_status() {
        let server =
            TestServer::spawn(|_, _, _| (StatusCode::SERVICE_UNAVAILABLE, String::new())).await;
        let sink = HttpBatchSink::new("queue", client(), server.url(""));
        let result = sink.submit_batch(&[WorkItem::new("a", "x")]).await;
        assert!(matches!(result, Err(PipelineError::TransientSink(_))));
    }

    #[tokio::test]
    async fn test_workflow_starter() {
        let server = TestServer::spawn(|_, path, body| {
            assert_eq!(path, "/state-machines/process-message/executions");
            let request: Value = serde_json::from_slice(body).unwrap();
            (
                StatusCode::OK,
                json!({
                    "executionId": format!("exec-{}", request["name"].as_str().unwrap()),
                    "startTime": "2024-05-01T10:00:00Z"
                })
                .to_string(),
            )
        })
        .await;

        let starter = HttpWorkflowStarter::new(client(), server.url(""), "process-message".into());
        let execution = starter.start("n1", "{}").await.unwrap();
        assert_eq!(execution.execution_id, "exec-n1");
    }

    #[tokio::test]
    async fn test_workflow_starter_escapes_state_machine() {
        let server = TestServer::spawn(|_, _, _| {
            (
                StatusCode::OK,
                json!({"executionId": "e", "startTime": "2024-05-01T10:00:00Z"}).to_string(),
            )
        })
        .await;

        let starter = HttpWorkflowStarter::new(
            client(),
            server.url("api/"),
            "billing/process message".into(),
        );
        starter.start("n1", "{}").await.unwrap();
        assert_eq!(
            server.requests()[0].path,
            "/api/state-machines/billing%2Fprocess%20message/executions"
        );
    }

    #[tokio::test]
    async fn test_text_generator() {
        let server = TestServer::spawn(|_, path, body| {
            assert_eq!(path, "/api/generate");
            let request: Value = serde_json::from_slice(body).unwrap();
            assert_eq!(request["model"], "tiny");
            assert_eq!(request["stream"], false);
            (
                StatusCode::OK,
                json!({"model": "tiny", "response": "a greeting"}).to_string(),
            )
        })
        .await;

        let generator = HttpTextGenerator::new(client(), server.url(""), "tiny".into());
        assert_eq!(generator.model(), "tiny");
        assert_eq!(generator.generate("hi").await.unwrap(), "a greeting");
    }

    #[tokio::test]
    async fn test_search_index_uses_basic_auth() {
        let server = TestServer::spawn(|_, _, _| (StatusCode::CREATED, "{}".into())).await;
        let index = HttpSearchIndex::new(
            client(),
            server.url(""),
            Some(BasicAuth {
                username: "admin".into(),
                password: "secret".into(),
            }),
        );

        index
            .put_document("messages", "a%2Fb.json", &json!({"message": "hi"}))
            .await
            .unwrap();

        let requests = server.requests();
        assert_eq!(requests[0].method, Method::PUT);
        assert_eq!(requests[0].path, "/messages/_doc/a%2Fb.json");
        assert!(
            requests[0]
                .authorization
                .as_deref()
                .is_some_and(|a| a.starts_with("Basic "))
        );
    }

    #[tokio::test]
    async fn test_webhook_gone_and_failed() {
        let server = TestServer::spawn(|_, path, _| match path {
            "/live" => (StatusCode::OK, String::new()),
            "/gone" => (StatusCode::GONE, String::new()),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, String::new()),
        })
        .await;
        let broadcaster = WebhookBroadcaster::new(client());
        let subscriber = |path: &str| Subscriber {
            subscriber_id: path.into(),
            endpoint: server.url(path).to_string(),
        };
        let notification = json!({"requestKey": "k"});

        assert_eq!(
            broadcaster
                .deliver(&subscriber("live"), &notification)
                .await,
            Ok(())
        );
        assert_eq!(
            broadcaster
                .deliver(&subscriber("gone"), &notification)
                .await,
            Err(DeliveryError::Gone)
        );
        assert!(matches!(
            broadcaster
                .deliver(&subscriber("broken"), &notification)
                .await,
            Err(DeliveryError::Failed(_))
        ));
    }
}
