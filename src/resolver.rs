//! CPU feature and model resolution.
//!
//! Combines the parsed capability documents, the cluster-supplied obsolete
//! model set and baseline model, and the architecture policy into the single
//! value the label builder consumes. Labels represent extra capability
//! beyond the guaranteed baseline floor, so baseline features are subtracted
//! from every per-model feature set before accumulation.

use std::collections::{BTreeSet, HashSet};

use crate::arch::Arch;
use crate::capabilities::{
    CpuFeatureSource, DomainCapabilities, FeatureSourceError,
    HostCapabilities, HostFeatures,
};

/// Everything the label builder needs, valid for one reconciliation cycle.
#[derive(Debug, Default, Clone)]
pub struct ResolvedCapabilities {
    /// Models the host can run today, deduplicated by name.
    pub usable_models: Vec<String>,
    /// Every model name seen anywhere in the documents; always a superset
    /// of `usable_models` so stale labels stay eligible for removal.
    pub known_models: Vec<String>,
    /// Union of per-model features minus the baseline floor.
    pub features: BTreeSet<String>,
    pub host_model: Option<HostCpuModel>,
    pub vendor: String,
    pub sev: bool,
    pub sev_es: bool,
    pub sev_snp: bool,
    pub secure_execution: bool,
    pub tdx: bool,
    pub tsc: Option<TscInfo>,
    pub machines: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct HostCpuModel {
    pub name: String,
    /// Migration fallback policy from the host-model entry.
    pub fallback: String,
    pub required_features: BTreeSet<String>,
}

#[derive(Debug, Clone)]
pub struct TscInfo {
    pub frequency: i64,
    pub scalable: bool,
}

pub struct ResolverInput<'a> {
    pub domain: &'a DomainCapabilities,
    pub host: &'a HostCapabilities,
    /// The host-supported-features probe document, when present.
    pub host_features: Option<&'a HostFeatures>,
    pub obsolete: &'a HashSet<String>,
    /// Minimum baseline model; its features are assumed always present.
    pub min_model: Option<&'a str>,
    pub arch: &'a Arch,
}

pub fn resolve(
    input: ResolverInput<'_>,
    source: &dyn CpuFeatureSource,
) -> Result<ResolvedCapabilities, FeatureSourceError> {
    let mut resolved = ResolvedCapabilities::default();
    let arch = input.arch;

    // Baseline features become the subtrahend for every usable model. They
    // only exist when a minimum model is configured and the document names a
    // vendor somewhere (vendor-less documents have no meaningful baseline).
    let min_model = input.min_model.filter(|m| !m.is_empty());
    let has_vendor = input
        .domain
        .modes()
        .iter()
        .any(|m| !m.vendor_name().is_empty());
    let baseline: BTreeSet<String> = match min_model {
        Some(model) if has_vendor => source.features(model)?,
        _ => BTreeSet::new(),
    };

    if arch.supports_named_models() {
        let mut seen_known = HashSet::new();
        let mut seen_usable = HashSet::new();
        for mode in input.domain.modes() {
            for model in &mode.models {
                let name = model.name();
                if name.is_empty() {
                    continue;
                }
                if seen_known.insert(name.to_string()) {
                    resolved.known_models.push(name.to_string());
                }
                if input.obsolete.contains(name) || model.usable != "yes" {
                    continue;
                }
                if !seen_usable.insert(name.to_string()) {
                    continue;
                }
                let features = source.features(name)?;
                resolved
                    .features
                    .extend(features.difference(&baseline).cloned());
                resolved.usable_models.push(name.to_string());
            }
        }
    }

    if arch.supports_host_model() {
        if let Some(mode) = input.domain.host_model_mode() {
            if let Some(entry) = mode.models.first() {
                // The probe document is authoritative where it exists; the
                // inline feature-policy list of the host-model mode covers
                // architectures without the probe (and hosts that have not
                // published it yet).
                let policies = match input.host_features {
                    Some(probe)
                        if arch.has_host_supported_features_probe() =>
                    {
                        &probe.features
                    }
                    _ => &mode.features,
                };
                let required_features = policies
                    .iter()
                    .filter(|f| arch.require_policy(f.policy.as_deref()))
                    .map(|f| f.name.clone())
                    .collect();
                resolved.host_model = Some(HostCpuModel {
                    name: entry.name().to_string(),
                    fallback: entry
                        .fallback
                        .clone()
                        .unwrap_or_default(),
                    required_features,
                });
            }
        }
    }

    // The vendor tag lives in the host-model mode; on architectures
    // without host-model support the document's modes carry no meaning
    // here and only the architecture default applies.
    resolved.vendor = if arch.supports_host_model() {
        input
            .domain
            .host_model_mode()
            .map(|m| m.vendor_name().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| arch.default_vendor().to_string())
    } else {
        arch.default_vendor().to_string()
    };

    let features = &input.domain.features;
    resolved.sev =
        features.sev.as_ref().is_some_and(|s| s.is_supported());
    resolved.sev_es =
        features.sev.as_ref().is_some_and(|s| s.supports_es());
    resolved.sev_snp = features
        .sev_snp
        .as_ref()
        .is_some_and(|f| f.is_supported());
    resolved.tdx =
        features.tdx.as_ref().is_some_and(|f| f.is_supported());
    resolved.secure_execution = features
        .s390_pv
        .as_ref()
        .is_some_and(|f| f.is_supported());

    if let Some(counter) = input.host.tsc_counter() {
        if let Some(frequency) = counter.frequency.filter(|f| *f > 0) {
            resolved.tsc = Some(TscInfo {
                frequency,
                scalable: counter.is_scalable(),
            });
        }
    }

    resolved.machines = input.host.machine_types();
    if let Some(machine) = input.domain.machine.as_deref() {
        if !machine.is_empty()
            && !resolved.machines.iter().any(|m| m == machine)
        {
            resolved.machines.push(machine.to_string());
        }
    }

    Ok(resolved)
}
