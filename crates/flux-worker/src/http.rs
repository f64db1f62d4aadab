//! HTTP implementation of the worker gateway
//!
//! Registration, heartbeats, and checkpoints are plain JSON POSTs; the
//! execution stream is consumed as server-sent events and decoded back
//! into protocol envelopes.

use std::sync::Arc;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use flux_core::{ErrorKind, Event, FluxError};
use flux_protocol::{
    CheckpointAck, Envelope, RegisterAck, RegisterRequest, WorkerCommand, WorkerGateway,
};

const COMMAND_BUFFER: usize = 32;

pub struct HttpGateway {
    base_url: String,
    client: reqwest::Client,
}

impl HttpGateway {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, FluxError> {
        let status = response.status();
        if status.is_success() {
            return response
                .json()
                .await
                .map_err(|e| FluxError::internal(format!("invalid server response: {e}")));
        }

        // Error bodies are `{error, kind}`
        let body: serde_json::Value = response.json().await.unwrap_or(json!({}));
        let kind = body
            .get("kind")
            .and_then(|k| serde_json::from_value::<ErrorKind>(k.clone()).ok())
            .unwrap_or(ErrorKind::Internal);
        let message = body
            .get("error")
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| format!("server returned {status}"));
        Err(FluxError::new(kind, message))
    }

    async fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        token: Option<&str>,
        body: serde_json::Value,
    ) -> Result<T, FluxError> {
        let mut request = self.client.post(self.url(path)).json(&body);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.map_err(connection_error)?;
        Self::decode(response).await
    }
}

fn connection_error(error: reqwest::Error) -> FluxError {
    FluxError::new(
        ErrorKind::WorkerDisconnected,
        format!("server unreachable: {error}"),
    )
}

#[async_trait]
impl WorkerGateway for HttpGateway {
    async fn register(&self, request: RegisterRequest) -> Result<RegisterAck, FluxError> {
        self.post(
            "/v1/workers/register",
            None,
            serde_json::to_value(request)?,
        )
        .await
    }

    async fn open_stream(
        &self,
        worker_id: &str,
        session_token: &str,
    ) -> Result<mpsc::Receiver<WorkerCommand>, FluxError> {
        let response = self
            .client
            .get(self.url(&format!("/v1/workers/{worker_id}/stream")))
            .bearer_auth(session_token)
            .send()
            .await
            .map_err(connection_error)?;
        if !response.status().is_success() {
            return Err(FluxError::validation(format!(
                "stream rejected with {}",
                response.status()
            )));
        }

        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let worker_id = worker_id.to_string();
        tokio::spawn(async move {
            let mut stream = response.bytes_stream().eventsource();
            while let Some(item) = stream.next().await {
                let sse = match item {
                    Ok(sse) => sse,
                    Err(error) => {
                        warn!(%worker_id, %error, "command stream broke");
                        break;
                    }
                };
                if sse.data.is_empty() {
                    continue;
                }
                let command = serde_json::from_str::<Envelope>(&sse.data)
                    .map_err(FluxError::from)
                    .and_then(|envelope| WorkerCommand::from_envelope(&envelope));
                match command {
                    Ok(command) => {
                        debug!(%worker_id, ?command, "command received");
                        if tx.send(command).await.is_err() {
                            break;
                        }
                    }
                    Err(error) => warn!(%worker_id, %error, "undecodable command"),
                }
            }
        });
        Ok(rx)
    }

    async fn heartbeat(
        &self,
        worker_id: &str,
        session_token: &str,
        in_flight: u32,
    ) -> Result<(), FluxError> {
        let _: serde_json::Value = self
            .post(
                &format!("/v1/workers/{worker_id}/heartbeat"),
                Some(session_token),
                json!({ "in_flight": in_flight }),
            )
            .await?;
        Ok(())
    }

    async fn checkpoint(
        &self,
        worker_id: &str,
        session_token: &str,
        execution_id: Uuid,
        events: Vec<Event>,
    ) -> Result<CheckpointAck, FluxError> {
        self.post(
            &format!("/v1/workers/{worker_id}/checkpoint"),
            Some(session_token),
            json!({ "execution_id": execution_id, "events": events }),
        )
        .await
    }

    async fn drain(&self, worker_id: &str, session_token: &str) -> Result<(), FluxError> {
        let _: serde_json::Value = self
            .post(
                &format!("/v1/workers/{worker_id}/drain"),
                Some(session_token),
                json!({}),
            )
            .await?;
        Ok(())
    }

    async fn deregister(&self, worker_id: &str, session_token: &str) -> Result<(), FluxError> {
        let response = self
            .client
            .delete(self.url(&format!("/v1/workers/{worker_id}")))
            .bearer_auth(session_token)
            .send()
            .await
            .map_err(connection_error)?;
        let _: serde_json::Value = Self::decode(response).await?;
        Ok(())
    }
}

/// Convenience constructor used by `main`.
pub fn http_gateway(base_url: &str) -> Arc<dyn WorkerGateway> {
    Arc::new(HttpGateway::new(base_url))
}
