//! Parsing of the hypervisor capability documents.
//!
//! The privileged toolstack drops three XML documents (plus per-model
//! feature definitions) under the capability mount path; this module turns
//! the raw bytes into structured values. Parsing fails only on structurally
//! malformed XML; any individual absent element is a valid, common case
//! meaning "not supported" and defaults to its zero value. Semantic checks
//! (usability flags, obsolete models) belong to the resolver.

mod domain;
mod features;
mod host;

pub use domain::{
    CpuMode, DomainCapabilities, FeaturePolicy, ModelEntry, SevBlock,
    SupportedFlag,
};
pub use features::{
    CpuFeatureSource, FeatureSourceError, FsCpuFeatureSource, HostFeatures,
};
pub use host::{Counter, HostCapabilities, MachineEntry};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("malformed capability document: {0}")]
    Xml(#[from] quick_xml::DeError),
    #[error("capability document is not valid utf-8: {0}")]
    Encoding(#[from] std::str::Utf8Error),
}

fn from_xml<T: serde::de::DeserializeOwned>(
    bytes: &[u8],
) -> Result<T, ParseError> {
    let text = std::str::from_utf8(bytes)?;
    Ok(quick_xml::de::from_str(text)?)
}

/// Parse the domain-capabilities document (CPU modes, models, confidential
/// computing blocks).
pub fn parse_domain_capabilities(
    bytes: &[u8],
) -> Result<DomainCapabilities, ParseError> {
    from_xml(bytes)
}

/// Parse the host-capabilities document (TSC counter, NUMA topology,
/// supported guest machine types).
pub fn parse_host_capabilities(
    bytes: &[u8],
) -> Result<HostCapabilities, ParseError> {
    from_xml(bytes)
}

/// Parse the host-supported-features probe document, a small `<cpu>` root
/// with a feature-policy list.
pub fn parse_supported_features(
    bytes: &[u8],
) -> Result<HostFeatures, ParseError> {
    from_xml(bytes)
}
