use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{ConfigMap, Node};
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::ResourceExt;
use serde_json::{Value, json};
use tracing::{debug, info, instrument};

use super::{ControllerContext, ReconcileErr};
use crate::arch::Arch;
use crate::capabilities::{
    self, DomainCapabilities, FsCpuFeatureSource, HostCapabilities,
    HostFeatures,
};
use crate::config::ClusterCpuConfig;
use crate::controller::events::{REASON_OBSOLETE_HOST_MODEL, emit_warning};
use crate::hyperv;
use crate::labels::{
    LabelDelta, OWNED_LABELS_ANNOTATION, SKIP_NODE_ANNOTATION,
    build_desired_labels, compute_delta, encode_owned_annotation,
    parse_owned_annotation,
};
use crate::resolver::{ResolverInput, resolve};

/// The domain-capabilities document and its historical alternate name.
const DOMAIN_CAPABILITIES_FILES: &[&str] =
    &["virsh_domcapabilities.xml", "domcapabilities.xml"];
const HOST_CAPABILITIES_FILE: &str = "capabilities.xml";
const SUPPORTED_FEATURES_FILE: &str = "supported_features.xml";

#[instrument(skip_all, fields(node = %node.name_any()))]
pub async fn reconcile(
    node: Arc<Node>,
    ctx: Arc<ControllerContext>,
) -> Result<Action, ReconcileErr> {
    let name = node.name_any();

    if has_skip_annotation(&node) {
        debug!("skip annotation present; leaving labels untouched");
        ctx.backoff.clear(&name);
        return Ok(Action::await_change());
    }

    let arch = ctx.cfg.arch();
    if !arch.should_label_node() {
        debug!(arch = %arch.name(), "architecture not supported; nothing to label");
        ctx.backoff.clear(&name);
        return Ok(Action::await_change());
    }

    // Without the virtualization device no meaningful capability data can
    // exist on this node yet; requeue until it appears.
    let device = Path::new(&ctx.cfg.device_path);
    if !device.exists() {
        return Err(ReconcileErr::DeviceMissing(
            ctx.cfg.device_path.clone(),
        ));
    }

    let cluster = load_cluster_config(&ctx).await?;
    let obsolete = cluster.obsolete_set();
    let docs = load_capability_documents(&ctx.cfg.capabilities_dir()).await?;
    let source = FsCpuFeatureSource::new(&ctx.cfg.capabilities_dir(), &arch);

    let resolved = resolve(
        ResolverInput {
            domain: &docs.domain,
            host: &docs.host,
            host_features: docs.host_features.as_ref(),
            obsolete: &obsolete,
            min_model: cluster.min_cpu_model.as_deref(),
            arch: &arch,
        },
        &source,
    )?;

    let hyperv = match arch {
        Arch::Amd64 => hyperv::scan(device),
        _ => BTreeSet::new(),
    };

    let host_model_obsolete = resolved
        .host_model
        .as_ref()
        .is_some_and(|hm| obsolete.contains(&hm.name));

    let desired =
        build_desired_labels(&resolved, &hyperv, host_model_obsolete);
    let delta = planned_label_writes(&node, &desired);
    let owned_annotation = encode_owned_annotation(&desired);
    let annotation_changed = node
        .annotations()
        .get(OWNED_LABELS_ANNOTATION)
        .map(String::as_str)
        != Some(owned_annotation.as_str());

    if !delta.is_empty() || annotation_changed {
        info!(
            set = delta.set.len(),
            removed = delta.remove.len(),
            "patching node labels"
        );
        let patch = build_metadata_patch(
            node.resource_version(),
            &delta,
            &owned_annotation,
        );
        let api: Api<Node> = Api::all(ctx.client.clone());
        api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
    } else {
        debug!("labels already up to date; no write");
    }

    if host_model_obsolete {
        let model = resolved
            .host_model
            .as_ref()
            .map(|hm| hm.name.clone())
            .unwrap_or_default();
        emit_warning(
            &ctx.recorder,
            &name,
            node.metadata.uid.as_deref(),
            REASON_OBSOLETE_HOST_MODEL,
            "LabelNode",
            Some(format!(
                "host CPU model {model} is in the configured obsolete list"
            )),
        )
        .await;
    }

    ctx.backoff.clear(&name);
    Ok(Action::await_change())
}

pub(crate) fn has_skip_annotation(node: &Node) -> bool {
    node.annotations().contains_key(SKIP_NODE_ANNOTATION)
}

/// Label writes for the node given the desired map. A node carrying the
/// skip annotation gets no writes regardless of its current labels, even
/// if a stale owned label is sitting on it.
pub(crate) fn planned_label_writes(
    node: &Node,
    desired: &BTreeMap<String, String>,
) -> LabelDelta {
    if has_skip_annotation(node) {
        return LabelDelta::default();
    }
    let owned = parse_owned_annotation(
        node.annotations().get(OWNED_LABELS_ANNOTATION),
    );
    compute_delta(node.labels(), &owned, desired)
}

/// Build the single merge patch that replaces labels and the owned-keys
/// annotation together. The observed resourceVersion rides along so a
/// concurrent writer turns this into a conflict instead of a lost update.
fn build_metadata_patch(
    resource_version: Option<String>,
    delta: &LabelDelta,
    owned_annotation: &str,
) -> Value {
    let mut labels = serde_json::Map::new();
    for key in &delta.remove {
        labels.insert(key.clone(), Value::Null);
    }
    for (key, value) in &delta.set {
        labels.insert(key.clone(), Value::String(value.clone()));
    }

    let mut metadata = serde_json::Map::new();
    if let Some(rv) = resource_version {
        metadata.insert("resourceVersion".into(), Value::String(rv));
    }
    metadata.insert("labels".into(), Value::Object(labels));
    metadata.insert(
        "annotations".into(),
        json!({ OWNED_LABELS_ANNOTATION: owned_annotation }),
    );
    json!({ "metadata": Value::Object(metadata) })
}

#[derive(Debug)]
struct CapabilityDocuments {
    domain: DomainCapabilities,
    host: HostCapabilities,
    host_features: Option<HostFeatures>,
}

async fn load_capability_documents(
    dir: &Path,
) -> Result<CapabilityDocuments, ReconcileErr> {
    let domain_bytes = read_first(dir, DOMAIN_CAPABILITIES_FILES).await?;
    let domain = capabilities::parse_domain_capabilities(&domain_bytes)?;

    let host_path = dir.join(HOST_CAPABILITIES_FILE);
    let host_bytes = tokio::fs::read(&host_path).await.map_err(|source| {
        ReconcileErr::CapabilityFile {
            path: host_path.display().to_string(),
            source,
        }
    })?;
    let host = capabilities::parse_host_capabilities(&host_bytes)?;

    // The probe document is optional; its absence means the architecture
    // (or toolstack version) does not publish it.
    let probe_path = dir.join(SUPPORTED_FEATURES_FILE);
    let host_features = match tokio::fs::read(&probe_path).await {
        Ok(bytes) => Some(capabilities::parse_supported_features(&bytes)?),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
        Err(source) => {
            return Err(ReconcileErr::CapabilityFile {
                path: probe_path.display().to_string(),
                source,
            });
        }
    };

    Ok(CapabilityDocuments {
        domain,
        host,
        host_features,
    })
}

async fn read_first(
    dir: &Path,
    candidates: &[&str],
) -> Result<Vec<u8>, ReconcileErr> {
    let mut last_err: Option<(String, std::io::Error)> = None;
    for candidate in candidates {
        let path = dir.join(candidate);
        match tokio::fs::read(&path).await {
            Ok(bytes) => return Ok(bytes),
            Err(err) => {
                last_err = Some((path.display().to_string(), err));
            }
        }
    }
    let (path, source) = last_err.expect("candidate list is never empty");
    Err(ReconcileErr::CapabilityFile { path, source })
}

async fn load_cluster_config(
    ctx: &ControllerContext,
) -> Result<ClusterCpuConfig, ReconcileErr> {
    let api: Api<ConfigMap> =
        Api::namespaced(ctx.client.clone(), &ctx.cfg.namespace);
    let Some(cm) = api.get_opt(&ctx.cfg.configmap_name).await? else {
        debug!(
            configmap = %ctx.cfg.configmap_name,
            "cluster cpu config not found; using defaults"
        );
        return Ok(ClusterCpuConfig::default());
    };
    let Some(payload) = cm
        .data
        .as_ref()
        .and_then(|d| d.get(ClusterCpuConfig::CONFIG_KEY))
    else {
        return Ok(ClusterCpuConfig::default());
    };
    serde_json::from_str(payload)
        .map_err(|e| ReconcileErr::Config(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn node_with(
        labels: &[(&str, &str)],
        annotations: &[(&str, &str)],
    ) -> Node {
        let to_map = |pairs: &[(&str, &str)]| -> BTreeMap<String, String> {
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect()
        };
        Node {
            metadata: ObjectMeta {
                name: Some("node1".into()),
                labels: Some(to_map(labels)),
                annotations: Some(to_map(annotations)),
                resource_version: Some("42".into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn skip_annotation_is_detected_with_any_value() {
        let node = node_with(&[], &[(SKIP_NODE_ANNOTATION, "")]);
        assert!(has_skip_annotation(&node));
        let node = node_with(&[], &[(SKIP_NODE_ANNOTATION, "because")]);
        assert!(has_skip_annotation(&node));
        let node = node_with(&[], &[]);
        assert!(!has_skip_annotation(&node));
    }

    #[test]
    fn skip_annotation_leaves_stale_labels_untouched() {
        let desired: BTreeMap<String, String> =
            [("cpu-model.node.oaas.io/Haswell".to_string(), "true".to_string())]
                .into();

        let node = node_with(
            &[("cpu-model.node.oaas.io/Penryn", "true")],
            &[(SKIP_NODE_ANNOTATION, "")],
        );
        let delta = planned_label_writes(&node, &desired);
        assert!(delta.is_empty());
        assert_eq!(
            node.labels().get("cpu-model.node.oaas.io/Penryn").unwrap(),
            "true"
        );

        // The same node without the annotation gets rewritten.
        let node =
            node_with(&[("cpu-model.node.oaas.io/Penryn", "true")], &[]);
        let delta = planned_label_writes(&node, &desired);
        assert!(delta
            .remove
            .contains("cpu-model.node.oaas.io/Penryn"));
        assert!(delta
            .set
            .contains_key("cpu-model.node.oaas.io/Haswell"));
    }

    #[test]
    fn metadata_patch_carries_removals_as_nulls() {
        let mut delta = LabelDelta::default();
        delta
            .set
            .insert("cpu-model.node.oaas.io/Haswell".into(), "true".into());
        delta.remove.insert("cpu-model.node.oaas.io/Penryn".into());
        let patch = build_metadata_patch(
            Some("42".into()),
            &delta,
            r#"["cpu-model.node.oaas.io/Haswell"]"#,
        );

        let meta = &patch["metadata"];
        assert_eq!(meta["resourceVersion"], "42");
        assert_eq!(
            meta["labels"]["cpu-model.node.oaas.io/Penryn"],
            Value::Null
        );
        assert_eq!(meta["labels"]["cpu-model.node.oaas.io/Haswell"], "true");
        assert_eq!(
            meta["annotations"][OWNED_LABELS_ANNOTATION],
            r#"["cpu-model.node.oaas.io/Haswell"]"#
        );
    }

    #[tokio::test]
    async fn missing_domain_capabilities_is_a_capability_file_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_capability_documents(dir.path()).await.unwrap_err();
        assert!(matches!(err, ReconcileErr::CapabilityFile { .. }));
    }

    #[tokio::test]
    async fn alternate_domain_capabilities_name_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(
            dir.path().join("domcapabilities.xml"),
            "<domainCapabilities><cpu/></domainCapabilities>",
        )
        .await
        .unwrap();
        tokio::fs::write(
            dir.path().join(HOST_CAPABILITIES_FILE),
            "<capabilities/>",
        )
        .await
        .unwrap();

        let docs = load_capability_documents(dir.path()).await.unwrap();
        assert!(docs.domain.modes().is_empty());
        assert!(docs.host_features.is_none());
    }

    #[tokio::test]
    async fn malformed_host_capabilities_aborts_the_load() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(
            dir.path().join("virsh_domcapabilities.xml"),
            "<domainCapabilities><cpu/></domainCapabilities>",
        )
        .await
        .unwrap();
        tokio::fs::write(
            dir.path().join(HOST_CAPABILITIES_FILE),
            "<capabilities><host>",
        )
        .await
        .unwrap();

        let err = load_capability_documents(dir.path()).await.unwrap_err();
        assert!(matches!(err, ReconcileErr::Parse(_)));
    }
}
