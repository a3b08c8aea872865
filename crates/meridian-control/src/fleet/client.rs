//! HTTP client for the provisioning service.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::FleetConfig;
use crate::error::{ControlError, ControlResult};
use crate::types::HostId;

use super::CloudFleetApi;

#[derive(Serialize)]
struct LaunchRequest<'a> {
    count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    image: Option<&'a str>,
}

#[derive(Serialize)]
struct TerminateRequest<'a> {
    host_ids: &'a [HostId],
    drain: bool,
}

#[derive(Serialize)]
struct HostsRequest<'a> {
    host_ids: &'a [HostId],
}

#[derive(Serialize)]
struct TagsRequest<'a> {
    host_ids: &'a [HostId],
    tag: &'a str,
}

#[derive(Deserialize)]
struct HostsResponse {
    host_ids: Vec<HostId>,
}

#[derive(Deserialize)]
struct PoolResponse {
    size: u64,
}

#[derive(Deserialize)]
struct TagsResponse {
    tags: HashMap<HostId, String>,
}

/// Fleet client backed by the provisioning service's HTTP API.
#[derive(Debug, Clone)]
pub struct HttpFleet {
    client: Client,
    base_url: String,
}

impl HttpFleet {
    /// Create a new fleet client from configuration.
    pub fn new(config: &FleetConfig) -> ControlResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(ControlError::Http)?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_owned(),
        })
    }

    /// Create a new fleet client with a custom base URL.
    pub fn with_url(url: impl Into<String>) -> ControlResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(ControlError::Http)?;

        Ok(Self {
            client,
            base_url: url.into().trim_end_matches('/').to_owned(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn post<B: Serialize + Sync>(&self, path: &str, body: &B) -> ControlResult<Response> {
        let response = self
            .client
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(ControlError::Http)?;

        check(path, response)
    }

    async fn post_json<B, R>(&self, path: &str, body: &B) -> ControlResult<R>
    where
        B: Serialize + Sync,
        R: DeserializeOwned,
    {
        self.post(path, body)
            .await?
            .json()
            .await
            .map_err(ControlError::Http)
    }
}

fn check(path: &str, response: Response) -> ControlResult<Response> {
    if response.status().is_success() {
        Ok(response)
    } else {
        Err(ControlError::fleet(format!(
            "{path} failed: {}",
            response.status()
        )))
    }
}

#[async_trait]
impl CloudFleetApi for HttpFleet {
    async fn launch_hosts(
        &self,
        cluster: &str,
        count: usize,
        image: Option<&str>,
    ) -> ControlResult<Vec<HostId>> {
        let path = format!("/clusters/{cluster}/hosts");
        let response: HostsResponse = self
            .post_json(&path, &LaunchRequest { count, image })
            .await?;
        Ok(response.host_ids)
    }

    async fn terminate_hosts(
        &self,
        cluster: &str,
        ids: &[HostId],
        drain: bool,
    ) -> ControlResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let path = format!("/clusters/{cluster}/hosts/terminate");
        self.post(&path, &TerminateRequest { host_ids: ids, drain })
            .await?;
        Ok(())
    }

    async fn list_terminated(&self, ids: &[HostId]) -> ControlResult<HashSet<HostId>> {
        if ids.is_empty() {
            return Ok(HashSet::new());
        }
        let response: HostsResponse = self
            .post_json("/hosts/terminated", &HostsRequest { host_ids: ids })
            .await?;
        Ok(response.host_ids.into_iter().collect())
    }

    async fn list_running(&self, ids: &[HostId]) -> ControlResult<Vec<HostId>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let response: HostsResponse = self
            .post_json("/hosts/running", &HostsRequest { host_ids: ids })
            .await?;

        let running: HashSet<HostId> = response.host_ids.into_iter().collect();
        Ok(ids.iter().filter(|id| running.contains(*id)).cloned().collect())
    }

    async fn attach_to_pool(&self, ids: &[HostId], cluster: &str) -> ControlResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let path = format!("/clusters/{cluster}/pool/attach");
        self.post(&path, &HostsRequest { host_ids: ids }).await?;
        Ok(())
    }

    async fn current_pool_size(&self, cluster: &str) -> ControlResult<u64> {
        let path = format!("/clusters/{cluster}/pool");
        let response = self
            .client
            .get(self.url(&path))
            .send()
            .await
            .map_err(ControlError::Http)?;

        let pool: PoolResponse = check(&path, response)?
            .json()
            .await
            .map_err(ControlError::Http)?;
        Ok(pool.size)
    }

    async fn host_tags(
        &self,
        ids: &[HostId],
        tag: &str,
    ) -> ControlResult<HashMap<HostId, String>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let response: TagsResponse = self
            .post_json("/hosts/tags", &TagsRequest { host_ids: ids, tag })
            .await?;
        Ok(response.tags)
    }
}
