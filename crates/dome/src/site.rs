//! Site reconciliation hooks. The dome tells the rest of the observatory
//! when the panel switch changes authority and when AC power comes and goes.
//! What those calls do on the other side is site-specific; the dome only
//! cares whether every one of them succeeded.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::{info, warn};

use crate::config::{HttpMethod, SiteConfig, SiteRequest};

#[async_trait]
pub trait SiteHooks: Send + Sync {
    async fn manual_to_auto(&self) -> bool;
    async fn auto_to_manual(&self) -> bool;
    async fn power_lost(&self) -> bool;
    async fn power_restored(&self) -> bool;
}

pub struct HttpSiteHooks {
    client: Client,
    cfg: SiteConfig,
}

impl HttpSiteHooks {
    pub fn new(cfg: &SiteConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(cfg.timeout_ms))
            .build()
            .context("failed to build site http client")?;
        Ok(Self {
            client,
            cfg: cfg.clone(),
        })
    }

    async fn call_all(&self, hook: &str, requests: &[SiteRequest]) -> bool {
        for req in requests {
            if let Err(e) = self.call(req).await {
                warn!(hook, url = %req.url, "site: request failed: {e:#}");
                return false;
            }
        }
        info!(hook, requests = requests.len(), "site: hook completed");
        true
    }

    async fn call(&self, req: &SiteRequest) -> Result<()> {
        let builder = match req.method {
            HttpMethod::Get => self.client.get(&req.url),
            HttpMethod::Put => self
                .client
                .put(&req.url)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(req.body.clone()),
        };
        let resp = builder.send().await.context("request not delivered")?;
        let status = resp.status();
        if status != StatusCode::OK {
            anyhow::bail!("unexpected status {status}");
        }
        Ok(())
    }
}

#[async_trait]
impl SiteHooks for HttpSiteHooks {
    async fn manual_to_auto(&self) -> bool {
        self.call_all("manual_to_auto", &self.cfg.manual_to_auto).await
    }

    async fn auto_to_manual(&self) -> bool {
        self.call_all("auto_to_manual", &self.cfg.auto_to_manual).await
    }

    async fn power_lost(&self) -> bool {
        self.call_all("power_lost", &self.cfg.power_lost).await
    }

    async fn power_restored(&self) -> bool {
        self.call_all("power_restored", &self.cfg.power_restored).await
    }
}

// ===========================================================================
// Tests
// ===========================================================================
