//! HTTP clients for the predictor services.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;

use super::{
    FusionPredictor, FusionRequest, FusionResponse, PassivePredictor, PassiveResponse,
    VisualPredictor, VisualRequest, VisualResponse,
};

fn build_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .context("Failed to create HTTP client")
}

async fn read_json<T: DeserializeOwned>(response: reqwest::Response, what: &str) -> Result<T> {
    if !response.status().is_success() {
        bail!("{what} request failed with status: {}", response.status());
    }

    response
        .json()
        .await
        .with_context(|| format!("Failed to parse {what} response"))
}

/// Face-expression predictor reached with `POST {url}`.
pub struct HttpVisualPredictor {
    client: reqwest::Client,
    url: String,
}

impl HttpVisualPredictor {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            url: url.into(),
        })
    }
}

#[async_trait]
impl VisualPredictor for HttpVisualPredictor {
    async fn predict(&self, request: &VisualRequest) -> Result<VisualResponse> {
        let response = self
            .client
            .post(&self.url)
            .json(request)
            .send()
            .await
            .context("Failed to reach visual predictor")?;

        read_json(response, "visual").await
    }
}

/// Biosignal predictor polled with `GET {url}`.
pub struct HttpPassivePredictor {
    client: reqwest::Client,
    url: String,
}

impl HttpPassivePredictor {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            url: url.into(),
        })
    }
}

#[async_trait]
impl PassivePredictor for HttpPassivePredictor {
    async fn poll(&self) -> Result<PassiveResponse> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .context("Failed to reach passive predictor")?;

        read_json(response, "passive").await
    }
}

/// Late-fusion predictor reached with `POST {url}`.
pub struct HttpFusionPredictor {
    client: reqwest::Client,
    url: String,
}

impl HttpFusionPredictor {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            url: url.into(),
        })
    }
}

#[async_trait]
impl FusionPredictor for HttpFusionPredictor {
    async fn fuse(&self, request: &FusionRequest) -> Result<FusionResponse> {
        let response = self
            .client
            .post(&self.url)
            .json(request)
            .send()
            .await
            .context("Failed to reach fusion predictor")?;

        read_json(response, "fusion").await
    }
}
