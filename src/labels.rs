//! Node label namespace and desired-state computation.
//!
//! Every label this controller writes lives under one of the prefixes below.
//! The controller records the exact keys it owns in the
//! [`OWNED_LABELS_ANNOTATION`] so a later cycle can compute an exact removal
//! set even when the desired set shrinks; the prefix list is a defensive
//! second net for keys the annotation lost track of.

use std::collections::{BTreeMap, BTreeSet};

use crate::resolver::ResolvedCapabilities;

pub const CPU_FEATURE_PREFIX: &str = "cpu-feature.node.oaas.io/";
pub const CPU_MODEL_PREFIX: &str = "cpu-model.node.oaas.io/";
pub const CPU_MODEL_MIGRATION_PREFIX: &str =
    "cpu-model-migration.node.oaas.io/";
pub const HOST_MODEL_CPU_PREFIX: &str = "host-model-cpu.node.oaas.io/";
pub const HOST_MODEL_REQUIRED_FEATURES_PREFIX: &str =
    "host-model-required-features.node.oaas.io/";
pub const HYPERV_PREFIX: &str = "hyperv.node.oaas.io/";
pub const CPU_VENDOR_PREFIX: &str = "cpu-vendor.node.oaas.io/";
pub const CPU_TIMER_PREFIX: &str = "cpu-timer.node.oaas.io/";
pub const SCHEDULING_PREFIX: &str = "scheduling.node.oaas.io/";
pub const SUPPORTED_MACHINE_TYPE_PREFIX: &str =
    "supported-machine-type.node.oaas.io/";

pub const SEV_LABEL: &str = "node.oaas.io/sev";
pub const SEV_ES_LABEL: &str = "node.oaas.io/sev-es";
pub const SEV_SNP_LABEL: &str = "node.oaas.io/sev-snp";
pub const SECURE_EXECUTION_LABEL: &str = "node.oaas.io/secure-execution";
pub const TDX_LABEL: &str = "node.oaas.io/tdx";
pub const OBSOLETE_HOST_MODEL_LABEL: &str =
    "node-labeller.oaas.io/obsolete-host-model";

/// Presence of this annotation (any value) suppresses all label mutation.
pub const SKIP_NODE_ANNOTATION: &str = "node-labeller.oaas.io/skip-node";
/// JSON array of the label keys this controller currently owns on the node.
pub const OWNED_LABELS_ANNOTATION: &str = "node-labeller.oaas.io/owned-labels";

const OWNED_PREFIXES: &[&str] = &[
    CPU_FEATURE_PREFIX,
    CPU_MODEL_PREFIX,
    CPU_MODEL_MIGRATION_PREFIX,
    HOST_MODEL_CPU_PREFIX,
    HOST_MODEL_REQUIRED_FEATURES_PREFIX,
    HYPERV_PREFIX,
    CPU_VENDOR_PREFIX,
    CPU_TIMER_PREFIX,
    SCHEDULING_PREFIX,
    SUPPORTED_MACHINE_TYPE_PREFIX,
    "node.oaas.io/",
    "node-labeller.oaas.io/",
];

/// Whether a label key belongs to a namespace this controller owns.
pub fn is_owned_key(key: &str) -> bool {
    OWNED_PREFIXES.iter().any(|p| key.starts_with(p))
}

/// Build the full desired label map from the resolved capabilities and the
/// independently scanned Hyper-V capability set. All values are "true"
/// except the TSC frequency itself.
pub fn build_desired_labels(
    resolved: &ResolvedCapabilities,
    hyperv: &BTreeSet<String>,
    host_model_obsolete: bool,
) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    let mut on = |key: String| {
        labels.insert(key, "true".to_string());
    };

    for feature in &resolved.features {
        on(format!("{CPU_FEATURE_PREFIX}{feature}"));
    }
    for model in &resolved.usable_models {
        on(format!("{CPU_MODEL_PREFIX}{model}"));
    }
    for machine in &resolved.machines {
        on(format!("{SUPPORTED_MACHINE_TYPE_PREFIX}{machine}"));
    }
    for name in hyperv {
        on(format!("{HYPERV_PREFIX}{name}"));
    }
    if !resolved.vendor.is_empty() {
        on(format!("{CPU_VENDOR_PREFIX}{}", resolved.vendor));
    }

    if let Some(host_model) = &resolved.host_model {
        if host_model_obsolete {
            // An obsolete host model must not be advertised as a migration
            // target; the marker label lets operators find affected nodes.
            on(OBSOLETE_HOST_MODEL_LABEL.to_string());
        } else {
            on(format!("{HOST_MODEL_CPU_PREFIX}{}", host_model.name));
            on(format!("{CPU_MODEL_MIGRATION_PREFIX}{}", host_model.name));
            for feature in &host_model.required_features {
                on(format!("{HOST_MODEL_REQUIRED_FEATURES_PREFIX}{feature}"));
            }
        }
    }

    if resolved.sev {
        on(SEV_LABEL.to_string());
    }
    if resolved.sev_es {
        on(SEV_ES_LABEL.to_string());
    }
    if resolved.sev_snp {
        on(SEV_SNP_LABEL.to_string());
    }
    if resolved.secure_execution {
        on(SECURE_EXECUTION_LABEL.to_string());
    }
    if resolved.tdx {
        on(TDX_LABEL.to_string());
    }

    if let Some(tsc) = &resolved.tsc {
        labels.insert(
            format!("{CPU_TIMER_PREFIX}tsc-frequency"),
            tsc.frequency.to_string(),
        );
        labels.insert(
            format!("{CPU_TIMER_PREFIX}tsc-scalable"),
            tsc.scalable.to_string(),
        );
        labels.insert(
            format!("{SCHEDULING_PREFIX}tsc-frequency-{}", tsc.frequency),
            "true".to_string(),
        );
    }

    labels
}

/// Label changes to apply to the node: keys to set (new or changed value)
/// and keys to remove. Foreign keys never appear in either set.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct LabelDelta {
    pub set: BTreeMap<String, String>,
    pub remove: BTreeSet<String>,
}

impl LabelDelta {
    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.remove.is_empty()
    }
}

/// Diff the desired label map against the node's current labels.
///
/// A current key is removed when it is absent from the desired set and was
/// either recorded as owned in a previous cycle or matches an owned prefix.
/// Everything else on the node is left untouched.
pub fn compute_delta(
    current: &BTreeMap<String, String>,
    previously_owned: &BTreeSet<String>,
    desired: &BTreeMap<String, String>,
) -> LabelDelta {
    let mut delta = LabelDelta::default();
    for key in current.keys() {
        if desired.contains_key(key) {
            continue;
        }
        if previously_owned.contains(key) || is_owned_key(key) {
            delta.remove.insert(key.clone());
        }
    }
    for (key, value) in desired {
        if current.get(key) != Some(value) {
            delta.set.insert(key.clone(), value.clone());
        }
    }
    delta
}

/// Decode the owned-labels annotation written by a previous cycle. A missing
/// or unreadable annotation degrades to "nothing tracked"; the prefix net in
/// [`compute_delta`] still cleans up.
pub fn parse_owned_annotation(value: Option<&String>) -> BTreeSet<String> {
    value
        .and_then(|v| serde_json::from_str::<BTreeSet<String>>(v).ok())
        .unwrap_or_default()
}

/// Encode the annotation value for the keys the controller now owns.
pub fn encode_owned_annotation(desired: &BTreeMap<String, String>) -> String {
    let keys: Vec<&str> = desired.keys().map(String::as_str).collect();
    serde_json::to_string(&keys).unwrap_or_else(|_| "[]".to_string())
}
