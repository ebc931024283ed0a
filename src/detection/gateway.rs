//! Boundary to the remote object-detection engine.
//!
//! The engine is handed the object key of an image that is already in the
//! artifact store and fetches the bytes itself. It writes its artifacts under
//! an output directory it reports back:
//!
//! ```text
//! <output_dir>/<file_name>               annotated image
//! <output_dir>/labels/<file_stem>.txt    label file, absent when nothing was found
//! ```

use std::{future::Future, path::PathBuf, time::Duration};

use anyhow::Context;
use serde::Deserialize;
use tracing::{debug, error, warn};
use url::Url;
use uuid::Uuid;

/// Success payload of the engine. Unknown fields are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InferenceOutput {
    pub output_dir: PathBuf,
}

/// Outcome of one engine call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InferenceResult {
    Success(InferenceOutput),
    /// The engine answered with a failure status, or could not be reached at
    /// all (`status` is `None` for transport failures such as timeouts).
    EngineError { status: Option<u16>, body: String },
    /// A success status whose body is not the expected JSON document.
    ProtocolError { reason: String },
}

impl InferenceResult {
    pub fn is_success(&self) -> bool {
        matches!(self, InferenceResult::Success(_))
    }
}

pub trait InferenceGateway: Send + Sync + 'static {
    /// Ask the engine to process the stored object. Never retries.
    fn invoke(
        &self,
        stored_key: &str,
        prediction_id: Uuid,
    ) -> impl Future<Output = InferenceResult> + Send;
}

/// Engine reached over HTTP: `POST <endpoint>?imgName=<key>&predictionId=<id>`.
#[derive(Debug, Clone)]
pub struct HttpInferenceGateway {
    client: reqwest::Client,
    endpoint: Url,
}

impl HttpInferenceGateway {
    pub fn new(endpoint: Url, request_timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .context("Failed to build inference HTTP client")?;
        Ok(Self { client, endpoint })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn request_url(&self, stored_key: &str, prediction_id: Uuid) -> Url {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("imgName", stored_key)
            .append_pair("predictionId", &prediction_id.to_string());
        url
    }
}

impl InferenceGateway for HttpInferenceGateway {
    async fn invoke(&self, stored_key: &str, prediction_id: Uuid) -> InferenceResult {
        let url = self.request_url(stored_key, prediction_id);
        debug!(%prediction_id, %url, "calling inference engine");

        let response = match self.client.post(url).send().await {
            Ok(response) => response,
            Err(err) => {
                error!(%prediction_id, error = %err, "inference engine unreachable");
                return InferenceResult::EngineError {
                    status: None,
                    body: err.to_string(),
                };
            }
        };

        let status = response.status();
        let body = match response.text().await {
            Ok(body) => body,
            Err(err) => {
                error!(%prediction_id, %status, error = %err, "failed to read inference response");
                return InferenceResult::EngineError {
                    status: Some(status.as_u16()),
                    body: err.to_string(),
                };
            }
        };

        if !status.is_success() {
            error!(%prediction_id, %status, %body, "inference engine returned an error");
            return InferenceResult::EngineError {
                status: Some(status.as_u16()),
                body,
            };
        }

        decode_output(&body).unwrap_or_else(|reason| {
            warn!(%prediction_id, %reason, "failed to decode inference response");
            InferenceResult::ProtocolError { reason }
        })
    }
}

fn decode_output(body: &str) -> Result<InferenceResult, String> {
    let output: InferenceOutput = serde_json::from_str(body).map_err(|err| err.to_string())?;
    if output.output_dir.as_os_str().is_empty() {
        return Err("output_dir is empty".to_string());
    }
    Ok(InferenceResult::Success(output))
}
