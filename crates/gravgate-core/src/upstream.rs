//! HTTP client for the upstream "Antigravity" endpoint family: a Gemini-
//! shaped Code Assist API reached through a fixed sandbox host. Every call
//! wraps the dialect-neutral request the Adapter produced in the envelope
//! the upstream expects and carries the headers it requires.

use std::time::Duration;

use bytes::Bytes;
use futures_util::Stream;
use reqwest::{Client, StatusCode};
use serde_json::{Value, json};

use gravgate_protocol::gemini;
use gravgate_transform::UpstreamRequest;

use crate::error::GatewayError;

const BASE_URL: &str = "https://daily-cloudcode-pa.sandbox.googleapis.com";
const USER_AGENT: &str = "antigravity/1.15.8 (Windows; AMD64)";

pub struct UpstreamClient {
    http: Client,
    retry_status_codes: Vec<u16>,
}

impl UpstreamClient {
    pub fn new(timeout: Duration, retry_status_codes: Vec<u16>) -> Result<Self, GatewayError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| GatewayError::UpstreamOther { status: 0, message: err.to_string() })?;
        Ok(Self { http, retry_status_codes })
    }

    pub fn is_retryable_status(&self, status: u16) -> bool {
        self.retry_status_codes.contains(&status)
    }

    fn request_type_for_model(model: &str) -> &'static str {
        if model.contains("image") { "image_gen" } else { "agent" }
    }

    fn envelope(project_id: &str, upstream: &UpstreamRequest) -> Value {
        json!({
            "model": upstream.model,
            "project": project_id,
            "request": upstream.body,
        })
    }

    fn headers(&self, builder: reqwest::RequestBuilder, access_token: &str, model: &str) -> reqwest::RequestBuilder {
        builder
            .bearer_auth(access_token)
            .header(reqwest::header::ACCEPT, "application/json")
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .header(reqwest::header::ACCEPT_ENCODING, "gzip")
            .header("requestid", uuid::Uuid::new_v4().to_string())
            .header("requesttype", Self::request_type_for_model(model))
    }

    pub async fn generate(
        &self,
        access_token: &str,
        project_id: &str,
        upstream: &UpstreamRequest,
    ) -> Result<gemini::GenerateContentResponse, GatewayError> {
        let url = format!("{BASE_URL}/v1internal:generateContent");
        let body = Self::envelope(project_id, upstream);
        let request = self
            .headers(self.http.post(&url), access_token, &upstream.model)
            .json(&body);
        let response = request.send().await.map_err(classify_transport_error)?;
        let response = self.ensure_success(response).await?;
        response
            .json()
            .await
            .map_err(|err| GatewayError::UpstreamTransient(err.to_string()))
    }

    pub async fn generate_stream(
        &self,
        access_token: &str,
        project_id: &str,
        upstream: &UpstreamRequest,
    ) -> Result<impl Stream<Item = reqwest::Result<Bytes>> + Send + 'static, GatewayError> {
        let url = format!("{BASE_URL}/v1internal:streamGenerateContent?alt=sse");
        let body = Self::envelope(project_id, upstream);
        let request = self
            .headers(self.http.post(&url), access_token, &upstream.model)
            .json(&body);
        let response = request.send().await.map_err(classify_transport_error)?;
        let response = self.ensure_success(response).await?;
        Ok(response.bytes_stream())
    }

    /// `POST /v1internal:countTokens`, wrapping `{request: {model, contents}}`
    /// per the upstream's own envelope for this one endpoint.
    pub async fn count_tokens(
        &self,
        access_token: &str,
        project_id: &str,
        model: &str,
        contents: &[gemini::Content],
    ) -> Result<u64, GatewayError> {
        let _ = project_id;
        let url = format!("{BASE_URL}/v1internal:countTokens");
        let body = json!({
            "request": {
                "model": format!("models/{model}"),
                "contents": contents,
            }
        });
        let request = self.headers(self.http.post(&url), access_token, model).json(&body);
        let response = request.send().await.map_err(classify_transport_error)?;
        let response = self.ensure_success(response).await?;
        let value: Value = response
            .json()
            .await
            .map_err(|err| GatewayError::UpstreamTransient(err.to_string()))?;
        Ok(value.get("totalTokens").and_then(Value::as_u64).unwrap_or(0))
    }

    pub async fn fetch_available_models(&self, access_token: &str, project_id: &str) -> Result<Value, GatewayError> {
        let url = format!("{BASE_URL}/v1internal:fetchAvailableModels");
        let body = json!({ "project": project_id });
        let request = self.headers(self.http.post(&url), access_token, "").json(&body);
        let response = request.send().await.map_err(classify_transport_error)?;
        let response = self.ensure_success(response).await?;
        response
            .json()
            .await
            .map_err(|err| GatewayError::UpstreamTransient(err.to_string()))
    }

    async fn ensure_success(&self, response: reqwest::Response) -> Result<reqwest::Response, GatewayError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let status_code = status.as_u16();
        let message = response.text().await.unwrap_or_default();
        Err(self.classify_status(status_code, message))
    }

    fn classify_status(&self, status: u16, message: String) -> GatewayError {
        if status == StatusCode::FORBIDDEN.as_u16() {
            GatewayError::UpstreamTerminalForCredential(message)
        } else if self.is_retryable_status(status) {
            GatewayError::UpstreamTransient(message)
        } else {
            GatewayError::UpstreamOther { status, message }
        }
    }
}

fn classify_transport_error(err: reqwest::Error) -> GatewayError {
    if err.is_timeout() {
        GatewayError::UpstreamTransient(format!("upstream timed out: {err}"))
    } else if err.is_connect() {
        GatewayError::UpstreamTransient(format!("upstream unreachable: {err}"))
    } else {
        GatewayError::UpstreamOther { status: 0, message: err.to_string() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_type_switches_on_image_models() {
        assert_eq!(UpstreamClient::request_type_for_model("gemini-3-pro-image"), "image_gen");
        assert_eq!(UpstreamClient::request_type_for_model("gemini-2.5-flash"), "agent");
    }

    #[test]
    fn classify_status_maps_forbidden_and_retryable_ranges() {
        let client = UpstreamClient::new(Duration::from_secs(1), vec![429, 500]).unwrap();
        assert!(matches!(
            client.classify_status(403, "nope".to_string()),
            GatewayError::UpstreamTerminalForCredential(_)
        ));
        assert!(matches!(
            client.classify_status(500, "boom".to_string()),
            GatewayError::UpstreamTransient(_)
        ));
        assert!(matches!(
            client.classify_status(404, "missing".to_string()),
            GatewayError::UpstreamOther { status: 404, .. }
        ));
    }
}
