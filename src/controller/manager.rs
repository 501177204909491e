use crate::error::Error;
use serde::Deserialize;
use std::time::Duration;

/// Client for the gateway's control API ("manager" on the wire).
///
/// Programming the gateway is best-effort per reconcile: failures leave the
/// AttackResponse short of Active and the next requeue retries.
#[derive(Clone)]
pub struct ManagerClient {
    client: reqwest::Client,
    base: String,
}

const MANAGER_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Deserialize)]
struct CleanupResponse {
    #[serde(default)]
    removed: bool,
}

impl ManagerClient {
    pub fn new(manager_url: &str) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .timeout(MANAGER_TIMEOUT)
            .build()
            .map_err(|e| Error::Manager(e.to_string()))?;
        Ok(Self {
            client,
            base: manager_url.trim_end_matches('/').to_string(),
        })
    }

    /// Install (or overwrite) the block entry routing `source_ip` across
    /// `decoy_urls`.
    pub async fn install_block(&self, source_ip: &str, decoy_urls: &[String]) -> Result<(), Error> {
        let body = serde_json::json!({
            "source_ip": source_ip,
            "decoy_urls": decoy_urls,
        });
        let resp = self
            .client
            .post(format!("{}/api/block_ip", self.base))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Manager(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(Error::Manager(format!(
                "install_block for {} returned {}",
                source_ip,
                resp.status()
            )));
        }
        Ok(())
    }

    /// Remove the block entry; returns whether one existed. Idempotent.
    pub async fn clear_block(&self, source_ip: &str) -> Result<bool, Error> {
        let body = serde_json::json!({ "source_ip": source_ip });
        let resp = self
            .client
            .post(format!("{}/api/cleanup", self.base))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Manager(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(Error::Manager(format!(
                "clear_block for {} returned {}",
                source_ip,
                resp.status()
            )));
        }
        let parsed: CleanupResponse = resp
            .json()
            .await
            .map_err(|e| Error::Manager(e.to_string()))?;
        Ok(parsed.removed)
    }
}
