use crate::http::{ResponseBody, full_body, json_response, make_error_response};
use hyper::body::Incoming;
use hyper::service::Service;
use hyper::{Method, Request, Response, StatusCode};
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

type ReadinessCheck = Arc<dyn Fn() -> bool + Send + Sync>;

/// Liveness and readiness endpoints served on the admin listener.
///
/// `/health` answers as long as the process is accepting connections. `/ready` reflects the
/// supplied check, which the pipeline flips once its collaborators are wired.
#[derive(Clone)]
pub struct AdminService {
    is_ready: ReadinessCheck,
}

impl AdminService {
    pub fn new<F>(is_ready: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        Self {
            is_ready: Arc::new(is_ready),
        }
    }

    pub fn respond(&self, method: &Method, path: &str) -> Response<ResponseBody> {
        if method != Method::GET {
            return make_error_response(StatusCode::METHOD_NOT_ALLOWED);
        }

        match path {
            "/health" => Response::new(full_body("ok\n")),
            "/ready" => {
                let ready = (self.is_ready)();
                let status = if ready {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                };
                json_response(status, &serde_json::json!({ "ready": ready }))
            }
            _ => make_error_response(StatusCode::NOT_FOUND),
        }
    }
}

impl Service<Request<Incoming>> for AdminService {
    type Response = Response<ResponseBody>;
    type Error = Infallible;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let response = self.respond(req.method(), req.uri().path());
        Box::pin(async move { Ok(response) })
    }
}
