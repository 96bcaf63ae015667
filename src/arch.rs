//! Per-architecture labelling policy.
//!
//! The hypervisor toolstack reports capabilities slightly differently on
//! each architecture, so everything architecture-specific is collected here
//! as a flat set of predicates on an `Arch` value. The rest of the crate
//! never matches on architecture strings directly.

/// Architecture of the node being labelled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arch {
    Amd64,
    Arm64,
    S390x,
    /// Labelling is disabled; the raw name is kept for diagnostics only.
    Unsupported(String),
}

impl Arch {
    /// Build from an architecture string. Accepts both the Go-style names
    /// used in node metadata ("amd64") and the values of
    /// `std::env::consts::ARCH` ("x86_64").
    pub fn from_name(name: &str) -> Arch {
        match name {
            "amd64" | "x86_64" => Arch::Amd64,
            "arm64" | "aarch64" => Arch::Arm64,
            "s390x" => Arch::S390x,
            other => Arch::Unsupported(other.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Arch::Amd64 => "amd64",
            Arch::Arm64 => "arm64",
            Arch::S390x => "s390x",
            Arch::Unsupported(raw) => raw,
        }
    }

    /// Whether this node should receive capability labels at all.
    pub fn should_label_node(&self) -> bool {
        !matches!(self, Arch::Unsupported(_))
    }

    /// Vendor to report when the capability XML does not state one.
    /// The s390x toolstack never emits a vendor tag.
    pub fn default_vendor(&self) -> &str {
        match self {
            Arch::S390x => "IBM",
            _ => "",
        }
    }

    /// Whether a feature entry with the given policy attribute counts as
    /// required. On s390x the toolstack omits the attribute entirely for
    /// required features, so a missing policy also counts there.
    pub fn require_policy(&self, policy: Option<&str>) -> bool {
        match self {
            Arch::S390x => matches!(policy, Some("require") | None),
            _ => policy == Some("require"),
        }
    }

    /// Whether the host publishes the separate supported-features probe
    /// document next to the capability XML.
    pub fn has_host_supported_features_probe(&self) -> bool {
        matches!(self, Arch::Amd64)
    }

    /// Whether host-model CPU mode is available.
    pub fn supports_host_model(&self) -> bool {
        matches!(self, Arch::Amd64 | Arch::S390x)
    }

    /// Whether named CPU models exist. arm64 is host-passthrough only.
    pub fn supports_named_models(&self) -> bool {
        matches!(self, Arch::Amd64 | Arch::S390x)
    }

    /// Filename prefix of the per-model feature definition files.
    pub fn model_file_prefix(&self) -> &str {
        match self {
            Arch::Amd64 => "x86",
            Arch::Arm64 => "arm",
            Arch::S390x => "s390x",
            Arch::Unsupported(_) => "",
        }
    }
}
