// This file is part of Vigil VRS, a multi-camera video recording supervisor.
// Copyright (C) 2024 The Vigil VRS Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Remote inference: POST the JPEG to a cloud endpoint and parse the report.

use std::path::Path;

use async_trait::async_trait;
use base::{err, Error};
use tracing::debug;

use crate::config::CloudDetectorConfig;
use crate::json::Detection;

pub(super) struct RemoteDetector {
    url: url::Url,
    key: Option<String>,
    client: reqwest::Client,
}

impl RemoteDetector {
    pub(super) fn new(cfg: &CloudDetectorConfig) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .build()
            .map_err(|e| err!(Internal, msg("build http client"), source(e)))?;
        Ok(RemoteDetector {
            url: cfg.url.clone(),
            key: cfg.key.clone(),
            client,
        })
    }
}

#[async_trait]
impl super::ObjectDetector for RemoteDetector {
    async fn detect(&self, frame: &Path) -> Result<Vec<Detection>, Error> {
        let bytes = tokio::fs::read(frame)
            .await
            .map_err(|e| err!(NotFound, msg("read {}", frame.display()), source(e)))?;
        debug!(url = %self.url, len = bytes.len(), "posting frame for inference");
        let mut req = self
            .client
            .post(self.url.clone())
            .header(reqwest::header::CONTENT_TYPE, "image/jpeg")
            .body(bytes);
        if let Some(key) = &self.key {
            req = req.header("x-api-key", key);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| err!(Unavailable, msg("post to {}", self.url), source(e)))?
            .error_for_status()
            .map_err(|e| err!(Unavailable, msg("inference endpoint error"), source(e)))?;
        let raw = resp
            .bytes()
            .await
            .map_err(|e| err!(Unavailable, msg("read inference response"), source(e)))?;
        super::parse_detections(&raw)
    }

    fn variant(&self) -> &'static str {
        "cloud"
    }
}
