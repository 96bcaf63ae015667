//! Node label reconciliation controller.
//!
//! One controller instance runs per node. It watches the local Node (the
//! initial watch list doubles as the startup trigger) and the cluster CPU
//! configuration ConfigMap, funnels both into the node key, and reconciles
//! with bounded concurrency. Failures are retried per key with exponential
//! backoff; one node's failure never affects another key in the queue.

pub mod events;
mod reconcile;

pub use reconcile::reconcile;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::StreamExt;
use k8s_openapi::api::core::v1::{ConfigMap, Node};
use kube::{
    Client, ResourceExt,
    api::Api,
    runtime::{
        Controller,
        controller::{Action, Config as ControllerConfig},
        events::{Recorder, Reporter},
        reflector::ObjectRef,
        watcher,
    },
};
use tracing::{error, info, warn};

use crate::capabilities::{FeatureSourceError, ParseError};
use crate::config::LabellerConfig;

#[derive(thiserror::Error, Debug)]
pub enum ReconcileErr {
    #[error("virtualization device {0} is not present on this node")]
    DeviceMissing(String),
    #[error("reading capability file {path}: {source}")]
    CapabilityFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Features(#[from] FeatureSourceError),
    #[error("cluster cpu config: {0}")]
    Config(String),
    #[error("kube api: {0}")]
    Kube(#[from] kube::Error),
}

/// Per-key exponential backoff tracker for the error policy.
#[derive(Default)]
pub struct ErrorBackoff {
    attempts: Mutex<HashMap<String, u32>>,
}

impl ErrorBackoff {
    const BASE: Duration = Duration::from_secs(5);
    const CAP: Duration = Duration::from_secs(300);

    pub fn next(&self, key: &str) -> Duration {
        let attempt = match self.attempts.lock() {
            Ok(mut attempts) => {
                let n = attempts.entry(key.to_string()).or_insert(0);
                *n = n.saturating_add(1);
                *n
            }
            Err(_) => 1,
        };
        Self::CAP
            .min(Self::BASE * 2u32.saturating_pow(attempt.saturating_sub(1)))
    }

    pub fn clear(&self, key: &str) {
        if let Ok(mut attempts) = self.attempts.lock() {
            attempts.remove(key);
        }
    }
}

pub struct ControllerContext {
    pub client: Client,
    pub cfg: LabellerConfig,
    pub recorder: Recorder,
    /// Consecutive failure count per node key, for backoff computation.
    pub backoff: ErrorBackoff,
}

impl ControllerContext {
    pub fn new(client: Client, cfg: LabellerConfig) -> Self {
        let recorder = Recorder::new(
            client.clone(),
            Reporter {
                controller: "oprc-node-labeller".into(),
                instance: Some(cfg.node_name.clone()),
            },
        );
        Self {
            client,
            cfg,
            recorder,
            backoff: ErrorBackoff::default(),
        }
    }
}

pub async fn run_controller(
    client: Client,
    cfg: LabellerConfig,
) -> anyhow::Result<()> {
    let nodes: Api<Node> = Api::all(client.clone());
    let node_watch = watcher::Config::default()
        .fields(&format!("metadata.name={}", cfg.node_name));

    let configmaps: Api<ConfigMap> =
        Api::namespaced(client.clone(), &cfg.namespace);
    let configmap_watch = watcher::Config::default()
        .fields(&format!("metadata.name={}", cfg.configmap_name));

    let threadiness = cfg.threadiness.max(1);
    let node_name = cfg.node_name.clone();
    let ctx = Arc::new(ControllerContext::new(client, cfg));

    info!(node = %node_name, threadiness, "starting node labeller controller");

    Controller::new(nodes, node_watch)
        .with_config(ControllerConfig::default().concurrency(threadiness))
        .watches(configmaps, configmap_watch, move |_cm: ConfigMap| {
            // Any change to the cluster CPU configuration re-enqueues the
            // local node.
            Some(ObjectRef::<Node>::new(&node_name))
        })
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj_ref, action)) => {
                    info!(node = %obj_ref.name, ?action, "reconciled")
                }
                Err(e) => error!(error = ?e, "reconcile error"),
            }
        })
        .await;

    Ok(())
}

fn error_policy(
    node: Arc<Node>,
    error: &ReconcileErr,
    ctx: Arc<ControllerContext>,
) -> Action {
    let name = node.name_any();
    let delay = ctx.backoff.next(&name);
    warn!(node = %name, %error, ?delay, "reconcile failed; requeueing");
    Action::requeue(delay)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_failure_and_resets_on_success() {
        let backoff = ErrorBackoff::default();
        assert_eq!(backoff.next("node1"), Duration::from_secs(5));
        assert_eq!(backoff.next("node1"), Duration::from_secs(10));
        assert_eq!(backoff.next("node1"), Duration::from_secs(20));
        // Other keys back off independently.
        assert_eq!(backoff.next("node2"), Duration::from_secs(5));
        backoff.clear("node1");
        assert_eq!(backoff.next("node1"), Duration::from_secs(5));
    }

    #[test]
    fn backoff_is_capped() {
        let backoff = ErrorBackoff::default();
        for _ in 0..20 {
            backoff.next("node1");
        }
        assert_eq!(backoff.next("node1"), Duration::from_secs(300));
    }
}
