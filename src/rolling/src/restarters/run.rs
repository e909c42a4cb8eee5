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

use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{bail, Context};
use async_trait::async_trait;
use dbops_maintenance::{ClusterNodesInfo, Node};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::filter::{select_nodes, DomainConstraint, FilterNodeParams};
use crate::restarters::Restarter;

/// The environment variable through which the payload learns which host to
/// restart.
pub const HOSTNAME_ENV_VAR: &str = "HOSTNAME";

/// Restarts nodes by running a user-supplied executable once per node.
///
/// The payload receives the node's host in `$HOSTNAME` and is expected to
/// exit zero once the node is back up. Both output streams are forwarded to
/// the log as the payload produces them.
#[derive(Debug)]
pub struct RunRestarter {
    payload: PathBuf,
}

impl RunRestarter {
    pub fn new(payload: PathBuf) -> RunRestarter {
        RunRestarter { payload }
    }
}

async fn forward_output<R>(reader: R, node_id: u32, stream: &'static str)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => info!(node_id, stream, "payload: {line}"),
            Ok(None) => break,
            Err(err) => {
                warn!(node_id, stream, "failed to read payload output: {err}");
                break;
            }
        }
    }
}

#[async_trait]
impl Restarter for RunRestarter {
    async fn candidate_nodes(
        &self,
        spec: &FilterNodeParams,
        cluster: &ClusterNodesInfo,
    ) -> Result<Vec<Node>, anyhow::Error> {
        let selected = select_nodes(spec, cluster, DomainConstraint::Any);
        debug!(
            nodes = ?selected.iter().map(|n| n.id).collect::<Vec<_>>(),
            "run restarter selected nodes",
        );
        Ok(selected)
    }

    async fn restart_node(&self, node: &Node) -> Result<(), anyhow::Error> {
        let mut child = Command::new(&self.payload)
            .env(HOSTNAME_ENV_VAR, &node.host)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("running restart payload {}", self.payload.display()))?;

        // The streams are forwarded concurrently with the wait so a chatty
        // payload cannot fill a pipe and deadlock itself.
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (status, (), ()) = tokio::join!(
            child.wait(),
            async {
                if let Some(stdout) = stdout {
                    forward_output(stdout, node.id, "stdout").await;
                }
            },
            async {
                if let Some(stderr) = stderr {
                    forward_output(stderr, node.id, "stderr").await;
                }
            },
        );

        let status = status.context("waiting for restart payload")?;
        if !status.success() {
            bail!("restart payload for node {} exited with {status}", node.id);
        }
        Ok(())
    }
}
