use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use super::domain::{FeaturePolicy, ModelEntry};
use super::ParseError;
use crate::arch::Arch;

/// The host-supported-features probe document: a small `<cpu>` root with a
/// feature-policy list, published alongside the capability XML on
/// architectures that have the probe.
#[derive(Debug, Default, Deserialize)]
pub struct HostFeatures {
    #[serde(default)]
    pub model: Option<ModelEntry>,
    #[serde(rename = "feature", default)]
    pub features: Vec<FeaturePolicy>,
}

#[derive(Error, Debug)]
pub enum FeatureSourceError {
    #[error("reading feature definition for model {model}: {source}")]
    Io {
        model: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing feature definition for model {model}: {source}")]
    Parse {
        model: String,
        #[source]
        source: ParseError,
    },
}

/// Loader of per-model feature definitions, keyed by CPU model name.
///
/// The resolver only depends on this trait; tests substitute an in-memory
/// map while production reads the architecture-prefixed files from the
/// capability mount path.
pub trait CpuFeatureSource {
    fn features(
        &self,
        model: &str,
    ) -> Result<BTreeSet<String>, FeatureSourceError>;
}

/// Filesystem-backed feature source reading
/// `<mount>/cpu_map/<prefix>_<model>.xml`.
pub struct FsCpuFeatureSource {
    dir: PathBuf,
    prefix: String,
}

impl FsCpuFeatureSource {
    pub fn new(mount_path: &Path, arch: &Arch) -> Self {
        Self {
            dir: mount_path.join("cpu_map"),
            prefix: arch.model_file_prefix().to_string(),
        }
    }
}

impl CpuFeatureSource for FsCpuFeatureSource {
    fn features(
        &self,
        model: &str,
    ) -> Result<BTreeSet<String>, FeatureSourceError> {
        let path = self.dir.join(format!("{}_{}.xml", self.prefix, model));
        let bytes =
            std::fs::read(&path).map_err(|source| FeatureSourceError::Io {
                model: model.to_string(),
                source,
            })?;
        let file: FeatureFile = super::from_xml(&bytes).map_err(|source| {
            FeatureSourceError::Parse {
                model: model.to_string(),
                source,
            }
        })?;
        Ok(file
            .models
            .iter()
            .flat_map(|m| m.features.iter())
            .map(|f| f.name.clone())
            .filter(|n| !n.is_empty())
            .collect())
    }
}

/// A per-model feature definition file:
/// `<cpus><model name='Penryn'><feature name='apic'/>...</model></cpus>`
#[derive(Debug, Default, Deserialize)]
struct FeatureFile {
    #[serde(rename = "model", default)]
    models: Vec<FeatureFileModel>,
}

#[derive(Debug, Default, Deserialize)]
struct FeatureFileModel {
    #[serde(rename = "@name", default)]
    name: String,
    #[serde(rename = "feature", default)]
    features: Vec<FeatureName>,
}

#[derive(Debug, Default, Deserialize)]
struct FeatureName {
    #[serde(rename = "@name", default)]
    name: String,
}
