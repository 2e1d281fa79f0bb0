use crate::{body_limit, status_error, Call, CallError, Config, MAX_ERROR_BODY};
use anyhow::Context;
use context_cache_core::Value;
use context_cache_k8s_api::{Method, ServiceCall};
use http::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};

/// Calls an HTTP(S) service.
#[derive(Clone, Debug)]
pub struct HttpCall {
    client: reqwest::Client,
    method: reqwest::Method,
    url: reqwest::Url,
    headers: HeaderMap,
    body: Option<Vec<u8>>,
    max_response_length: usize,
}

impl HttpCall {
    pub fn new(
        service: &ServiceCall,
        method: Method,
        body: Option<Vec<u8>>,
        config: Config,
    ) -> anyhow::Result<Self> {
        let url = reqwest::Url::parse(&service.url)
            .with_context(|| format!("invalid service URL {:?}", service.url))?;

        let mut headers = HeaderMap::with_capacity(service.headers.len() + 1);
        if body.is_some() {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        }
        for header in &service.headers {
            let name = HeaderName::try_from(header.key.as_str())
                .with_context(|| format!("invalid header name {:?}", header.key))?;
            let value = HeaderValue::try_from(header.value.as_str())
                .with_context(|| format!("invalid value for header {:?}", header.key))?;
            headers.append(name, value);
        }

        let mut client = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(config.timeout);
        if let Some(bundle) = service.ca_bundle.as_deref().filter(|b| !b.is_empty()) {
            let cert = reqwest::Certificate::from_pem(bundle.as_bytes())
                .context("invalid CA bundle")?;
            client = client.add_root_certificate(cert);
        }

        Ok(Self {
            client: client.build()?,
            method: match method {
                Method::Get => reqwest::Method::GET,
                Method::Post => reqwest::Method::POST,
            },
            url,
            headers,
            body,
            max_response_length: config.max_response_length,
        })
    }
}

#[async_trait::async_trait]
impl Call for HttpCall {
    async fn call(&self) -> Result<Value, CallError> {
        let mut request = self
            .client
            .request(self.method.clone(), self.url.clone())
            .headers(self.headers.clone());
        if let Some(body) = &self.body {
            request = request.body(body.clone());
        }
        let mut response = request
            .send()
            .await
            .map_err(|e| CallError::Transport(e.into()))?;

        let status = response.status();
        if !status.is_success() {
            let mut body = Vec::new();
            while body.len() < MAX_ERROR_BODY {
                match response.chunk().await {
                    Ok(Some(chunk)) => body.extend_from_slice(&chunk),
                    Ok(None) | Err(_) => break,
                }
            }
            return Err(status_error(status, &body));
        }

        let limit = body_limit(self.max_response_length);
        if response
            .content_length()
            .is_some_and(|len| usize::try_from(len).map_or(true, |len| len > limit))
        {
            return Err(CallError::TooLarge { limit });
        }
        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| CallError::Transport(e.into()))?
        {
            if body.len() + chunk.len() > limit {
                return Err(CallError::TooLarge { limit });
            }
            body.extend_from_slice(&chunk);
        }

        Ok(serde_json::from_slice(&body)?)
    }
}
