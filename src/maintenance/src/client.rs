// Copyright the dbops authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License in the LICENSE file at the
// root of this repository, or online at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! HTTP implementation of the maintenance service client.

use anyhow::Context;
use async_trait::async_trait;
use reqwest::RequestBuilder;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    AvailabilityMode, CmsClient, MaintenanceTask, MaintenanceTaskParams, Node,
};

/// Talks to the maintenance service over its HTTP+JSON API.
///
/// Only the endpoint and an optional bearer token are configurable here;
/// certificate handling is left to the platform defaults.
#[derive(Debug, Clone)]
pub struct HttpCmsClient {
    http: reqwest::Client,
    endpoint: String,
    token: Option<String>,
}

#[derive(Debug, Serialize)]
struct CreateTaskRequest {
    task_uid: String,
    availability_mode: AvailabilityMode,
    duration_seconds: u64,
    node_ids: Vec<u32>,
}

#[derive(Debug, Deserialize)]
struct NodesResponse {
    nodes: Vec<Node>,
}

impl HttpCmsClient {
    pub fn new(endpoint: String, token: Option<String>) -> HttpCmsClient {
        HttpCmsClient {
            http: reqwest::Client::new(),
            endpoint: endpoint.trim_end_matches('/').to_owned(),
            token,
        }
    }

    fn authenticated(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint, path)
    }
}

#[async_trait]
impl CmsClient for HttpCmsClient {
    async fn nodes(&self) -> Result<Vec<Node>, anyhow::Error> {
        let res: NodesResponse = self
            .authenticated(self.http.get(self.url("/cluster/nodes")))
            .send()
            .await
            .and_then(|res| res.error_for_status())
            .context("listing cluster nodes")?
            .json()
            .await
            .context("decoding cluster nodes")?;
        Ok(res.nodes)
    }

    async fn create_maintenance_task(
        &self,
        params: MaintenanceTaskParams,
    ) -> Result<MaintenanceTask, anyhow::Error> {
        debug!(
            task_uid = %params.task_uid,
            mode = %params.availability_mode,
            nodes = params.nodes.len(),
            "creating maintenance task",
        );
        let body = CreateTaskRequest {
            task_uid: params.task_uid,
            availability_mode: params.availability_mode,
            duration_seconds: params.duration.as_secs(),
            node_ids: params.nodes.iter().map(|n| n.id).collect(),
        };
        self.authenticated(self.http.post(self.url("/maintenance/tasks")))
            .json(&body)
            .send()
            .await
            .and_then(|res| res.error_for_status())
            .with_context(|| format!("creating maintenance task {}", body.task_uid))?
            .json()
            .await
            .context("decoding maintenance task")
    }

    async fn refresh_maintenance_task(
        &self,
        task_uid: &str,
    ) -> Result<MaintenanceTask, anyhow::Error> {
        self.authenticated(
            self.http
                .get(self.url(&format!("/maintenance/tasks/{task_uid}"))),
        )
        .send()
        .await
        .and_then(|res| res.error_for_status())
        .with_context(|| format!("reading maintenance task {task_uid}"))?
        .json()
        .await
        .context("decoding maintenance task")
    }

    async fn complete_action(&self, action_uid: &str) -> Result<(), anyhow::Error> {
        debug!(action_uid, "completing maintenance action");
        self.authenticated(
            self.http
                .post(self.url(&format!("/maintenance/actions/{action_uid}/complete"))),
        )
        .send()
        .await
        .and_then(|res| res.error_for_status())
        .with_context(|| format!("completing maintenance action {action_uid}"))?;
        Ok(())
    }
}
