//! Generic HTTP adapter for REST generation backends.
//!
//! Covers both invocation modes behind one wire shape: a submit that
//! returns either a terminal result or a task id, and a task endpoint the
//! poll loop queries. Provider-specific quirks belong in per-provider
//! request builders, not here.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{GenerationProvider, Invocation, Payload, PollOutcome, ProviderArtifact, ProviderCall};
use crate::catalog::{InvocationMode, ProviderDescriptor};
use crate::error::{ForgeError, Result};
use crate::job::PendingHandle;
use crate::schema::ParamMap;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug)]
pub struct HttpProvider {
    descriptor: ProviderDescriptor,
    client: reqwest::Client,
    api_key: Option<String>,
}

#[derive(Serialize)]
struct SubmitBody<'a> {
    model: &'a str,
    prompt: &'a str,
    parameters: &'a ParamMap,
    #[serde(skip_serializing_if = "Option::is_none")]
    script: Option<&'a str>,
    /// Pre-signed destination; a provider that uses it answers with
    /// `storage_path` instead of inline bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    upload_url: Option<&'a str>,
}

#[derive(Deserialize)]
struct TaskResponse {
    status: String,
    #[serde(default)]
    task_id: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    artifact: Option<WireArtifact>,
}

#[derive(Deserialize)]
struct WireArtifact {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    data_base64: Option<String>,
    #[serde(default)]
    text: Option<String>,
    /// Set when the provider uploaded directly to a pre-signed destination.
    #[serde(default)]
    storage_path: Option<String>,
    content_type: String,
    #[serde(default)]
    seed: Option<u64>,
    #[serde(default)]
    width: Option<u32>,
    #[serde(default)]
    height: Option<u32>,
    #[serde(default)]
    cost: Option<f64>,
}

impl HttpProvider {
    pub fn new(descriptor: ProviderDescriptor, api_key: Option<String>) -> Result<Self> {
        url::Url::parse(&descriptor.base_url).map_err(|e| {
            ForgeError::Internal(format!(
                "provider {} has an invalid base_url: {e}",
                descriptor.provider_id
            ))
        })?;
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ForgeError::Internal(format!("http client: {e}")))?;
        Ok(Self {
            descriptor,
            client,
            api_key,
        })
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }

    fn provider_err(&self, step: &str, message: impl Into<String>) -> ForgeError {
        ForgeError::Provider {
            step: step.to_string(),
            message: message.into(),
        }
    }

    async fn fetch_payload(&self, wire: WireArtifact, step: &str) -> Result<ProviderArtifact> {
        let payload = if let Some(text) = wire.text {
            Payload::Text(text)
        } else if let Some(path) = wire.storage_path {
            Payload::Stored(path)
        } else if let Some(data) = wire.data_base64 {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(data)
                .map_err(|e| self.provider_err(step, format!("bad artifact encoding: {e}")))?;
            Payload::Bytes(bytes.into())
        } else if let Some(url) = wire.url {
            let resp = self
                .client
                .get(&url)
                .send()
                .await
                .map_err(|e| self.provider_err(step, format!("artifact download: {e}")))?;
            let bytes = resp
                .error_for_status()
                .map_err(|e| self.provider_err(step, format!("artifact download: {e}")))?
                .bytes()
                .await
                .map_err(|e| self.provider_err(step, format!("artifact download: {e}")))?;
            Payload::Bytes(bytes)
        } else {
            return Err(self.provider_err(step, "response carried no artifact payload"));
        };

        Ok(ProviderArtifact {
            payload,
            content_type: wire.content_type,
            seed: wire.seed,
            width: wire.width,
            height: wire.height,
            provider_cost: wire.cost,
        })
    }

    /// Terminal statuses only; pending is handled by the caller.
    async fn interpret(&self, resp: TaskResponse, step: &str) -> Result<Invocation> {
        match resp.status.as_str() {
            "succeeded" => {
                let wire = resp
                    .artifact
                    .ok_or_else(|| self.provider_err(step, "succeeded without an artifact"))?;
                let artifact = self.fetch_payload(wire, step).await?;
                Ok(Invocation::Completed(artifact))
            }
            "failed" => Err(self.provider_err(
                step,
                resp.error.unwrap_or_else(|| "unspecified failure".into()),
            )),
            other => Err(self.provider_err(step, format!("unknown status '{other}'"))),
        }
    }
}

#[async_trait]
impl GenerationProvider for HttpProvider {
    fn provider_id(&self) -> &str {
        &self.descriptor.provider_id
    }

    async fn submit(&self, call: &ProviderCall) -> Result<Invocation> {
        let step = call.stage.step_name();
        let url = format!("{}/generations", self.descriptor.base_url.trim_end_matches('/'));
        let body = SubmitBody {
            model: &call.model_reference,
            prompt: &call.prompt,
            parameters: &call.parameters,
            script: call.script.as_deref(),
            upload_url: call.upload.as_ref().map(|u| u.upload_url.as_str()),
        };

        tracing::debug!(
            provider = %self.descriptor.provider_id,
            job_id = %call.job_id,
            model = %call.model_reference,
            step,
            "submitting to provider"
        );

        let resp = self
            .authorize(self.client.post(&url).json(&body))
            .send()
            .await
            .map_err(|e| self.provider_err(step, format!("request: {e}")))?;
        if !resp.status().is_success() {
            let status = resp.status();
            // The raw body can carry anything the backend felt like
            // dumping; it goes to the log, never to a caller.
            let detail: Value = resp.json().await.unwrap_or(Value::Null);
            tracing::warn!(
                provider = %self.descriptor.provider_id,
                %status,
                body = %detail,
                "provider rejected the submission"
            );
            return Err(self.provider_err(step, format!("HTTP {status}")));
        }
        let parsed: TaskResponse = resp
            .json()
            .await
            .map_err(|e| self.provider_err(step, format!("malformed response: {e}")))?;

        // Non-terminal statuses hand back a task handle in async mode; a
        // sync provider has no business returning one.
        if matches!(parsed.status.as_str(), "pending" | "running") {
            return match self.descriptor.invocation_mode {
                InvocationMode::AsyncPoll => {
                    let task_id = parsed
                        .task_id
                        .ok_or_else(|| self.provider_err(step, "pending response without task id"))?;
                    Ok(Invocation::Pending(PendingHandle {
                        provider_id: self.descriptor.provider_id.clone(),
                        task_id,
                    }))
                }
                InvocationMode::Sync => {
                    Err(self.provider_err(step, "sync provider returned a pending status"))
                }
            };
        }

        self.interpret(parsed, step).await
    }

    async fn poll(&self, handle: &PendingHandle) -> Result<PollOutcome> {
        let url = format!(
            "{}/generations/{}",
            self.descriptor.base_url.trim_end_matches('/'),
            handle.task_id
        );
        let resp = self
            .authorize(self.client.get(&url))
            .send()
            .await
            .map_err(|e| self.provider_err("poll", format!("request: {e}")))?;
        if !resp.status().is_success() {
            return Err(self.provider_err("poll", format!("HTTP {}", resp.status())));
        }
        let parsed: TaskResponse = resp
            .json()
            .await
            .map_err(|e| self.provider_err("poll", format!("malformed response: {e}")))?;

        match parsed.status.as_str() {
            "succeeded" => {
                let wire = parsed
                    .artifact
                    .ok_or_else(|| self.provider_err("poll", "succeeded without an artifact"))?;
                Ok(PollOutcome::Ready(self.fetch_payload(wire, "poll").await?))
            }
            "failed" => Ok(PollOutcome::Failed(
                parsed.error.unwrap_or_else(|| "unspecified failure".into()),
            )),
            "pending" | "running" => Ok(PollOutcome::InProgress),
            other => Err(self.provider_err("poll", format!("unknown status '{other}'"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Stage;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use uuid::Uuid;

    fn descriptor(base_url: String) -> ProviderDescriptor {
        ProviderDescriptor {
            provider_id: "pixelforge".into(),
            invocation_mode: InvocationMode::Sync,
            base_url,
            credentials_ref: None,
        }
    }

    /// Serve one canned HTTP response on a local port, then hang up.
    async fn one_shot_server(response: String) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        format!("http://{addr}")
    }

    fn call() -> ProviderCall {
        ProviderCall {
            job_id: Uuid::new_v4(),
            model_reference: "image-basic".into(),
            stage: Stage::Asset,
            prompt: "a fox".into(),
            parameters: ParamMap::new(),
            script: None,
            upload: None,
        }
    }

    #[tokio::test]
    async fn rejected_submit_surfaces_the_status_but_not_the_body() {
        let body = r#"{"error":"stack trace with internal hostnames"}"#;
        let response = format!(
            "HTTP/1.1 500 Internal Server Error\r\n\
             content-type: application/json\r\n\
             content-length: {}\r\n\
             connection: close\r\n\r\n{body}",
            body.len()
        );
        let base_url = one_shot_server(response).await;
        let provider = HttpProvider::new(descriptor(base_url), None).unwrap();

        let err = provider.submit(&call()).await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("500"), "got: {message}");
        assert!(!message.contains("internal hostnames"), "got: {message}");
    }

    #[test]
    fn bad_base_url_is_rejected_at_construction() {
        let err = HttpProvider::new(descriptor("not a url".into()), None).unwrap_err();
        assert_eq!(err.kind(), "internal");
    }
}
