//! Client side of the exercise analysis service contract.

use std::time::Duration;

use async_trait::async_trait;
use protofit_types::{
    analysis::{AnalysisRequest, AnalysisResult},
    config::AnalysisConfig,
    ProtofitError, Result,
};
use reqwest::{header::CONTENT_TYPE, Client, Url};
use tracing::{debug, info};

#[async_trait]
pub trait AnalysisService: Send + Sync {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<AnalysisResult>;
    /// Probe the service root. Returns the banner text on success.
    async fn health(&self) -> Result<String>;
}

#[async_trait]
impl<T: AnalysisService + ?Sized> AnalysisService for std::sync::Arc<T> {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<AnalysisResult> {
        (**self).analyze(request).await
    }

    async fn health(&self) -> Result<String> {
        (**self).health().await
    }
}

/// `POST <endpoint>` with a JSON body, as served by the ProtoFit backend.
#[derive(Clone)]
pub struct HttpAnalysisClient {
    client: Client,
    endpoint: Url,
}

impl HttpAnalysisClient {
    pub fn new(config: &AnalysisConfig) -> Result<Self> {
        let endpoint = Url::parse(config.endpoint.trim()).map_err(|err| {
            analysis_error(format!(
                "invalid analysis endpoint '{}': {err}",
                config.endpoint
            ))
        })?;
        let mut builder = Client::builder();
        if let Some(timeout_ms) = config.request_timeout_ms {
            builder = builder.timeout(Duration::from_millis(timeout_ms));
        }
        let client = builder
            .build()
            .map_err(|err| analysis_error(format!("failed to build HTTP client: {err}")))?;
        Ok(Self { client, endpoint })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn root(&self) -> Url {
        let mut root = self.endpoint.clone();
        root.set_path("/");
        root.set_query(None);
        root
    }
}

#[async_trait]
impl AnalysisService for HttpAnalysisClient {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<AnalysisResult> {
        debug!(
            "POST {} exercise={} image={} chars",
            self.endpoint,
            request.exercise,
            request.image.len()
        );
        let response = self
            .client
            .post(self.endpoint.clone())
            .header(CONTENT_TYPE, "application/json")
            .json(request)
            .send()
            .await
            .map_err(|err| analysis_error(format!("request to {} failed: {err}", self.endpoint)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProtofitError::AnalysisStatus {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json::<AnalysisResult>()
            .await
            .map_err(|err| analysis_error(format!("malformed analysis response: {err}")))
    }

    async fn health(&self) -> Result<String> {
        let root = self.root();
        let response = self
            .client
            .get(root.clone())
            .send()
            .await
            .map_err(|err| analysis_error(format!("health probe to {root} failed: {err}")))?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(ProtofitError::AnalysisStatus {
                status: status.as_u16(),
                body,
            });
        }
        info!("Analysis service at {} answered: {}", root, body.trim());
        Ok(body)
    }
}

pub fn analysis_error(message: impl Into<String>) -> ProtofitError {
    ProtofitError::Analysis(message.into())
}
