use crate::{body_limit, status_error, Call, CallError, MAX_ERROR_BODY};
use anyhow::{ensure, Context};
use context_cache_core::Value;
use context_cache_k8s_api::{Client, Method};
use http_body_util::{BodyExt, LengthLimitError, Limited};
use kube::client::Body;

/// Calls a path on the Kubernetes API server with the controller's credentials.
#[derive(Clone)]
pub struct ApiServerCall {
    client: Client,
    method: http::Method,
    path: http::Uri,
    body: Option<Vec<u8>>,
    max_response_length: usize,
}

impl ApiServerCall {
    pub fn new(
        client: Client,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
        max_response_length: usize,
    ) -> anyhow::Result<Self> {
        ensure!(path.starts_with('/'), "urlPath {path:?} must be absolute");
        let path = path
            .parse::<http::Uri>()
            .with_context(|| format!("invalid urlPath {path:?}"))?;
        Ok(Self {
            client,
            method: match method {
                Method::Get => http::Method::GET,
                Method::Post => http::Method::POST,
            },
            path,
            body,
            max_response_length,
        })
    }

    fn request(&self) -> Result<http::Request<Body>, CallError> {
        let builder = http::Request::builder()
            .method(self.method.clone())
            .uri(self.path.clone());
        let request = match &self.body {
            Some(body) => builder
                .header(http::header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.clone())),
            None => builder.body(Body::empty()),
        };
        request.map_err(|e| CallError::Transport(e.into()))
    }
}

#[async_trait::async_trait]
impl Call for ApiServerCall {
    async fn call(&self) -> Result<Value, CallError> {
        let response = self
            .client
            .send(self.request()?)
            .await
            .map_err(|e| CallError::Transport(e.into()))?;

        let status = response.status();
        if !status.is_success() {
            // Error bodies beyond the reporting limit are not read.
            let body = Limited::new(response.into_body(), MAX_ERROR_BODY)
                .collect()
                .await
                .map(|body| body.to_bytes())
                .unwrap_or_default();
            return Err(status_error(status, &body));
        }

        let limit = body_limit(self.max_response_length);
        let body = Limited::new(response.into_body(), limit)
            .collect()
            .await
            .map_err(|error| {
                if error.downcast_ref::<LengthLimitError>().is_some() {
                    CallError::TooLarge { limit }
                } else {
                    CallError::Transport(error)
                }
            })?
            .to_bytes();

        Ok(serde_json::from_slice(&body)?)
    }
}

impl std::fmt::Debug for ApiServerCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiServerCall")
            .field("method", &self.method)
            .field("path", &self.path)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::{
        matchers::{method, path},
        Mock, MockServer, ResponseTemplate,
    };

    fn client(server: &MockServer) -> Client {
        let url = server.uri().parse().expect("server URI must parse");
        Client::try_from(kube::Config::new(url)).expect("client must build")
    }

    #[tokio::test]
    async fn gets_api_path() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/namespaces"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "kind": "NamespaceList" })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let call = ApiServerCall::new(client(&server), Method::Get, "/api/v1/namespaces", None, 0)
            .expect("call must build");
        assert_eq!(call.call().await.unwrap(), json!({ "kind": "NamespaceList" }));

        server.verify().await;
    }

    #[tokio::test]
    async fn limits_response_length() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "x": "y".repeat(64) })))
            .mount(&server)
            .await;

        let call = ApiServerCall::new(client(&server), Method::Get, "/apis", None, 32).unwrap();
        assert!(matches!(
            call.call().await,
            Err(CallError::TooLarge { limit: 32 })
        ));
    }

    #[tokio::test]
    async fn rejects_error_statuses() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_string("not found"))
            .mount(&server)
            .await;

        let call = ApiServerCall::new(client(&server), Method::Get, "/api/v1/nope", None, 0).unwrap();
        assert!(matches!(
            call.call().await,
            Err(CallError::Status { status, .. }) if status == http::StatusCode::NOT_FOUND
        ));
    }

    #[tokio::test]
    async fn reports_status_of_large_error_bodies() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403).set_body_string("f".repeat(4096)))
            .mount(&server)
            .await;

        let call = ApiServerCall::new(client(&server), Method::Get, "/apis", None, 32).unwrap();
        assert!(matches!(
            call.call().await,
            Err(CallError::Status { status, .. }) if status == http::StatusCode::FORBIDDEN
        ));
    }

    #[tokio::test]
    async fn rejects_relative_paths() {
        let server = MockServer::start().await;
        assert!(ApiServerCall::new(client(&server), Method::Get, "api/v1", None, 0).is_err());
    }
}
