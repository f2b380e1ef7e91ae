use crate::errors::PipelineError;
use crate::handlers::Handlers;
use crate::invocation::InvocationEnvelope;
use crate::metrics_defs::{REQUEST_DURATION, REQUESTS_INFLIGHT};
use http_body_util::BodyExt;
use hyper::body::{Bytes, Incoming};
use hyper::service::Service;
use hyper::{Method, Request, Response, StatusCode};
use serde_json::json;
use shared::http::{ResponseBody, json_response, make_error_response};
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

const INVOKE_PREFIX: &str = "/invoke/";

/// Serves `POST /invoke/{handler}` on the main listener.
#[derive(Clone)]
pub struct PipelineService {
    handlers: Arc<Handlers>,
}

impl PipelineService {
    pub fn new(handlers: Arc<Handlers>) -> Self {
        Self { handlers }
    }

    pub async fn respond(&self, method: &Method, path: &str, body: Bytes) -> Response<ResponseBody> {
        let Some(name) = path.strip_prefix(INVOKE_PREFIX) else {
            return make_error_response(StatusCode::NOT_FOUND);
        };
        let Some(handler) = self.handlers.get(name) else {
            tracing::warn!(handler = name, "Unknown handler");
            return error_response(&PipelineError::NotFound(format!("handler {name}")));
        };
        if method != Method::POST {
            return make_error_response(StatusCode::METHOD_NOT_ALLOWED);
        }

        let start = Instant::now();
        shared::gauge!(REQUESTS_INFLIGHT).increment(1.0);

        // An empty body is an invocation without records
        let envelope = if body.is_empty() {
            Ok(InvocationEnvelope::default())
        } else {
            serde_json::from_slice::<InvocationEnvelope>(&body)
                .map_err(|e| PipelineError::InvalidPayload(format!("malformed invocation: {e}")))
        };
        let result = match envelope {
            Ok(envelope) => {
                tracing::debug!(handler = name, records = envelope.records.len(), "Invoking");
                handler.handle(envelope).await
            }
            Err(e) => Err(e),
        };

        let response = match result {
            Ok(response) => json_response(StatusCode::OK, &response),
            Err(e) => {
                tracing::error!(handler = name, error = %e, "Invocation failed");
                error_response(&e)
            }
        };

        shared::gauge!(REQUESTS_INFLIGHT).decrement(1.0);
        shared::histogram!(
            REQUEST_DURATION,
            "status" => response.status().as_u16().to_string(),
            "handler" => handler.name()
        )
        .record(start.elapsed().as_secs_f64());
        response
    }
}

/// Callers only see the summarized reason, never the underlying error chain.
fn error_response(error: &PipelineError) -> Response<ResponseBody> {
    json_response(error.status_code(), &json!({"error": error.to_string()}))
}

impl Service<Request<Incoming>> for PipelineService {
    type Response = Response<ResponseBody>;
    type Error = Infallible;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let service = self.clone();
        Box::pin(async move {
            let (parts, body) = req.into_parts();
            let response = match body.collect().await {
                Ok(collected) => {
                    service
                        .respond(&parts.method, parts.uri.path(), collected.to_bytes())
                        .await
                }
                Err(e) => error_response(&PipelineError::RequestBody(e.to_string())),
            };
            Ok(response)
        })
    }
}
