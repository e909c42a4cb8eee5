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

//! dbops: common cluster maintenance operations.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use dbops_maintenance::{request_host_maintenance, AvailabilityMode, HttpCmsClient};
use dbops_rolling::filter::FilterNodeParams;
use dbops_rolling::restarters::{
    BaremetalRestarter, KubernetesRestarter, Restarter, RunRestarter,
};
use dbops_rolling::{RestartOptions, RollingRestart};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod render;

use crate::render::StdoutPresenter;

#[derive(Debug, Parser)]
#[clap(name = "dbops", about = "Common cluster maintenance operations.", long_about = None)]
struct Args {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Roll a restart through the cluster without violating its
    /// availability guarantees.
    Restart(RestartCommand),
    /// Operate on maintenance tasks directly, without restarting anything.
    Maintenance(MaintenanceCommand),
}

#[derive(Debug, clap::Args)]
struct MaintenanceCommand {
    #[clap(subcommand)]
    request: MaintenanceRequest,
}

#[derive(Debug, Subcommand)]
enum MaintenanceRequest {
    /// Request maintenance locks for every node on one host and print the
    /// created task's UID, for later use with `restart --task-uid`.
    Host(MaintenanceHostArgs),
}

#[derive(Debug, clap::Args)]
struct MaintenanceHostArgs {
    /// Base URL of the cluster maintenance service.
    #[clap(long, env = "DBOPS_ENDPOINT")]
    endpoint: String,
    /// Environment variable holding the bearer token for the maintenance
    /// service, if it requires one.
    #[clap(long)]
    token_env: Option<String>,
    /// Availability policy under which the service grants node locks.
    #[clap(long, value_enum, default_value_t = AvailabilityMode::Strict)]
    availability_mode: AvailabilityMode,
    /// Maximum time any lock in the task may be held before the service
    /// reclaims it.
    #[clap(long, value_parser = humantime::parse_duration, default_value = "1h")]
    duration: Duration,
    /// Host FQDN whose nodes to put under maintenance.
    #[clap(long)]
    host: String,
    /// Enable debug logging.
    #[clap(long)]
    verbose: bool,
}

#[derive(Debug, clap::Args)]
struct RestartCommand {
    #[clap(flatten)]
    common: CommonArgs,
    #[clap(subcommand)]
    target: RestartTarget,
}

#[derive(Debug, Subcommand)]
enum RestartTarget {
    /// Restart storage nodes.
    Storage {
        #[clap(subcommand)]
        deployment: Deployment,
    },
    /// Restart tenant database nodes.
    Tenant {
        #[clap(subcommand)]
        deployment: Deployment,
    },
    /// Restart nodes by running a local payload once per node.
    Run {
        /// Executable invoked per node with the node's host in $HOSTNAME.
        #[clap(long)]
        payload: PathBuf,
    },
}

#[derive(Debug, Subcommand)]
enum Deployment {
    /// The cluster runs in Kubernetes; a restart replaces the backing pod.
    K8s(K8sArgs),
    /// The cluster runs on bare hosts; a restart goes over SSH.
    Baremetal(BaremetalArgs),
}

#[derive(Debug, clap::Args)]
struct K8sArgs {
    /// Path to a kubeconfig file; the in-cluster or default configuration
    /// is used when absent.
    #[clap(long)]
    kubeconfig: Option<PathBuf>,
    /// Namespace the cluster's pods live in.
    #[clap(long, default_value = "default")]
    namespace: String,
}

#[derive(Debug, clap::Args)]
struct BaremetalArgs {
    /// Login user for SSH connections; defaults to the ambient SSH
    /// configuration.
    #[clap(long)]
    ssh_user: Option<String>,
    /// Systemd unit to restart on each host.
    #[clap(long)]
    systemd_unit: Option<String>,
}

#[derive(Debug, clap::Args)]
struct CommonArgs {
    /// Base URL of the cluster maintenance service.
    #[clap(long, env = "DBOPS_ENDPOINT")]
    endpoint: String,
    /// Environment variable holding the bearer token for the maintenance
    /// service, if it requires one.
    #[clap(long)]
    token_env: Option<String>,
    /// Availability policy under which the service grants node locks.
    #[clap(long, value_enum, default_value_t = AvailabilityMode::Strict)]
    availability_mode: AvailabilityMode,
    /// Maximum time any single node lock may be held before the service
    /// reclaims it.
    #[clap(long, value_parser = humantime::parse_duration, default_value = "1h")]
    duration: Duration,
    /// Additional restart attempts per node after the first failure.
    #[clap(long, default_value_t = 3)]
    restart_retry_number: usize,
    /// Resume a previously created maintenance task instead of creating a
    /// new one.
    #[clap(long)]
    task_uid: Option<String>,
    /// Delay between polls of the maintenance task when the service does
    /// not suggest one.
    #[clap(long, value_parser = humantime::parse_duration, default_value = "30s")]
    poll_interval: Duration,
    /// Node ids to restart.
    #[clap(long, value_delimiter = ',')]
    nodes: Vec<u32>,
    /// Host FQDNs to restart.
    #[clap(long, value_delimiter = ',')]
    hosts: Vec<String>,
    /// Tenants whose nodes to restart.
    #[clap(long, value_delimiter = ',')]
    tenants: Vec<String>,
    /// Node ids to never restart.
    #[clap(long, value_delimiter = ',')]
    exclude_nodes: Vec<u32>,
    /// Host FQDNs to never restart.
    #[clap(long, value_delimiter = ',')]
    exclude_hosts: Vec<String>,
    /// Enable debug logging.
    #[clap(long)]
    verbose: bool,
}

impl CommonArgs {
    fn filter_params(&self) -> FilterNodeParams {
        FilterNodeParams {
            selected_node_ids: self.nodes.iter().copied().collect(),
            selected_hosts: self.hosts.iter().cloned().collect(),
            selected_tenants: self.tenants.iter().cloned().collect(),
            excluded_node_ids: self.exclude_nodes.iter().copied().collect(),
            excluded_hosts: self.exclude_hosts.iter().cloned().collect(),
        }
    }

    fn restart_options(&self) -> RestartOptions {
        RestartOptions {
            availability_mode: self.availability_mode,
            duration: self.duration,
            restart_retry_number: self.restart_retry_number,
            task_uid: self.task_uid.clone(),
            poll_interval: self.poll_interval,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let verbose = match &args.command {
        Command::Restart(restart) => restart.common.verbose,
        Command::Maintenance(MaintenanceCommand {
            request: MaintenanceRequest::Host(host),
        }) => host.verbose,
    };

    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match run(args).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

/// Returns whether the requested operation fully succeeded.
async fn run(args: Args) -> Result<bool, anyhow::Error> {
    match args.command {
        Command::Restart(restart) => run_restart(restart).await,
        Command::Maintenance(MaintenanceCommand {
            request: MaintenanceRequest::Host(host),
        }) => run_host_maintenance(host).await,
    }
}

fn read_token(token_env: &Option<String>) -> Result<Option<String>, anyhow::Error> {
    match token_env {
        Some(name) => Ok(Some(
            std::env::var(name).with_context(|| format!("reading token from ${name}"))?,
        )),
        None => Ok(None),
    }
}

async fn run_host_maintenance(args: MaintenanceHostArgs) -> Result<bool, anyhow::Error> {
    let cms = HttpCmsClient::new(args.endpoint.clone(), read_token(&args.token_env)?);
    let task_uid =
        request_host_maintenance(&cms, &args.host, args.availability_mode, args.duration).await?;
    println!("{task_uid}");
    Ok(true)
}

/// Returns whether every target node was restarted successfully.
async fn run_restart(restart: RestartCommand) -> Result<bool, anyhow::Error> {
    let token = read_token(&restart.common.token_env)?;
    let cms = Arc::new(HttpCmsClient::new(restart.common.endpoint.clone(), token));

    let restarter: Box<dyn Restarter> = match restart.target {
        RestartTarget::Storage {
            deployment: Deployment::K8s(k8s),
        } => Box::new(KubernetesRestarter::storage(k8s.kubeconfig, k8s.namespace)),
        RestartTarget::Storage {
            deployment: Deployment::Baremetal(host),
        } => Box::new(BaremetalRestarter::storage(host.ssh_user, host.systemd_unit)),
        RestartTarget::Tenant {
            deployment: Deployment::K8s(k8s),
        } => Box::new(KubernetesRestarter::tenant(k8s.kubeconfig, k8s.namespace)),
        RestartTarget::Tenant {
            deployment: Deployment::Baremetal(host),
        } => Box::new(BaremetalRestarter::tenant(host.ssh_user, host.systemd_unit)),
        RestartTarget::Run { payload } => Box::new(RunRestarter::new(payload)),
    };

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received; releasing held locks before exit");
            trigger.cancel();
        }
    });

    let rolling = RollingRestart::new(cms, restarter, restart.common.restart_options())
        .with_presenter(Box::new(StdoutPresenter));
    let report = rolling.run(&restart.common.filter_params(), &shutdown).await?;
    Ok(report.failures.is_empty())
}
