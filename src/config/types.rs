use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use envconfig::Envconfig;
use serde::Deserialize;

use crate::arch::Arch;

/// Process configuration. Every path is an explicit field so tests can
/// point the controller at fixture directories.
#[derive(Envconfig, Clone, Debug)]
pub struct LabellerConfig {
    /// Name of the Node this process labels; injected via the downward API.
    #[envconfig(from = "NODE_NAME")]
    pub node_name: String,

    #[envconfig(from = "OPRC_NL_NAMESPACE", default = "default")]
    pub namespace: String,

    /// Mount path the privileged toolstack populates with the capability
    /// documents and the per-model feature definitions.
    #[envconfig(
        from = "OPRC_NL_CAPABILITIES_PATH",
        default = "/var/lib/oprc-node-labeller"
    )]
    pub capabilities_path: String,

    /// The hypervisor device node probed by the Hyper-V scanner and used
    /// as the hard precondition for labelling at all.
    #[envconfig(from = "OPRC_NL_DEVICE_PATH", default = "/dev/kvm")]
    pub device_path: String,

    /// ConfigMap carrying the cluster CPU configuration (obsolete models,
    /// minimum baseline model).
    #[envconfig(
        from = "OPRC_NL_CONFIGMAP",
        default = "virt-capabilities-config"
    )]
    pub configmap_name: String,

    /// Worker concurrency of the reconcile queue.
    #[envconfig(from = "OPRC_NL_THREADINESS", default = "1")]
    pub threadiness: u16,

    /// Architecture override for tests; defaults to the runtime-detected
    /// architecture.
    #[envconfig(from = "OPRC_NL_ARCH")]
    pub arch_override: Option<String>,
}

impl LabellerConfig {
    pub fn arch(&self) -> Arch {
        Arch::from_name(
            self.arch_override
                .as_deref()
                .unwrap_or(std::env::consts::ARCH),
        )
    }

    pub fn capabilities_dir(&self) -> PathBuf {
        Path::new(&self.capabilities_path).to_path_buf()
    }
}

/// Cluster-supplied CPU configuration, read each cycle from the ConfigMap's
/// `config.json` data key. Absent ConfigMap or key degrades to defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ClusterCpuConfig {
    /// Model name to obsolete flag; only entries set to true count.
    #[serde(rename = "obsoleteCPUModels")]
    pub obsolete_cpu_models: HashMap<String, bool>,
    /// Floor model whose features are excluded from per-model labels.
    #[serde(rename = "minCPUModel")]
    pub min_cpu_model: Option<String>,
}

impl ClusterCpuConfig {
    pub const CONFIG_KEY: &'static str = "config.json";

    pub fn obsolete_set(&self) -> HashSet<String> {
        self.obsolete_cpu_models
            .iter()
            .filter(|(_, obsolete)| **obsolete)
            .map(|(name, _)| name.clone())
            .collect()
    }
}
