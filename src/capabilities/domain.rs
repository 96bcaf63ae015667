use serde::Deserialize;

/// Parsed `<domainCapabilities>` document. Created fresh each cycle and
/// never mutated after parse.
#[derive(Debug, Default, Deserialize)]
pub struct DomainCapabilities {
    /// Default machine type for new guests, when the toolstack states one.
    #[serde(default)]
    pub machine: Option<String>,
    #[serde(default)]
    pub cpu: CpuSection,
    #[serde(default)]
    pub features: FeatureSection,
}

impl DomainCapabilities {
    pub fn modes(&self) -> &[CpuMode] {
        &self.cpu.modes
    }

    /// The host-model mode, when the document carries one.
    pub fn host_model_mode(&self) -> Option<&CpuMode> {
        self.cpu.modes.iter().find(|m| m.name == "host-model")
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct CpuSection {
    #[serde(rename = "mode", default)]
    pub modes: Vec<CpuMode>,
}

/// One `<mode>` element: host-passthrough, host-model or custom.
#[derive(Debug, Default, Deserialize)]
pub struct CpuMode {
    #[serde(rename = "@name", default)]
    pub name: String,
    #[serde(rename = "@supported", default)]
    pub supported: String,
    #[serde(default)]
    pub vendor: Option<String>,
    /// Inline feature-policy list; only host-model mode carries one.
    #[serde(rename = "feature", default)]
    pub features: Vec<FeaturePolicy>,
    #[serde(rename = "model", default)]
    pub models: Vec<ModelEntry>,
}

impl CpuMode {
    pub fn vendor_name(&self) -> &str {
        self.vendor.as_deref().unwrap_or("").trim()
    }
}

/// `<model usable='yes' fallback='allow'>Penryn</model>`
#[derive(Debug, Default, Deserialize)]
pub struct ModelEntry {
    #[serde(rename = "@usable", default)]
    pub usable: String,
    #[serde(rename = "@fallback", default)]
    pub fallback: Option<String>,
    #[serde(rename = "$text", default)]
    pub name: String,
}

impl ModelEntry {
    pub fn name(&self) -> &str {
        self.name.trim()
    }
}

/// `<feature policy='require' name='ds'/>`; the policy attribute may be
/// absent (see the per-architecture policy rules).
#[derive(Debug, Default, Deserialize)]
pub struct FeaturePolicy {
    #[serde(rename = "@policy", default)]
    pub policy: Option<String>,
    #[serde(rename = "@name", default)]
    pub name: String,
}

/// `<features>` block. Every sub-element is optional; absence means the
/// capability is not supported.
#[derive(Debug, Default, Deserialize)]
pub struct FeatureSection {
    #[serde(default)]
    pub sev: Option<SevBlock>,
    #[serde(rename = "sev-snp", default)]
    pub sev_snp: Option<SupportedFlag>,
    #[serde(default)]
    pub tdx: Option<SupportedFlag>,
    /// s390x Secure Execution.
    #[serde(rename = "s390-pv", default)]
    pub s390_pv: Option<SupportedFlag>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SevBlock {
    #[serde(rename = "@supported", default)]
    pub supported: String,
    #[serde(default)]
    pub cbitpos: Option<u32>,
    #[serde(rename = "reducedPhysBits", default)]
    pub reduced_phys_bits: Option<u32>,
    #[serde(rename = "maxGuests", default)]
    pub max_guests: Option<u32>,
    #[serde(rename = "maxESGuests", default)]
    pub max_es_guests: Option<u32>,
}

impl SevBlock {
    pub fn is_supported(&self) -> bool {
        self.supported == "yes"
    }

    /// SEV-ES requires encrypted-state guest slots on top of plain SEV.
    pub fn supports_es(&self) -> bool {
        self.is_supported() && self.max_es_guests.unwrap_or(0) > 0
    }
}

/// A bare `<x supported='yes'/>` capability element.
#[derive(Debug, Default, Deserialize)]
pub struct SupportedFlag {
    #[serde(rename = "@supported", default)]
    pub supported: String,
}

impl SupportedFlag {
    pub fn is_supported(&self) -> bool {
        self.supported == "yes"
    }
}

#[cfg(test)]
mod tests {
    use crate::capabilities::parse_domain_capabilities;

    const FULL: &str = r#"
        <domainCapabilities>
          <path>/usr/bin/qemu-system-x86_64</path>
          <domain>kvm</domain>
          <machine>pc-q35-7.2</machine>
          <cpu>
            <mode name='host-passthrough' supported='yes'/>
            <mode name='host-model' supported='yes'>
              <model fallback='forbid'>Skylake-Client-IBRS</model>
              <vendor>Intel</vendor>
              <feature policy='require' name='ds'/>
              <feature policy='disable' name='mpx'/>
            </mode>
            <mode name='custom' supported='yes'>
              <model usable='yes'>Penryn</model>
              <model usable='no'>EPYC-IBPB</model>
              <model usable='maybe'>Weird</model>
            </mode>
          </cpu>
          <features>
            <sev supported='yes'>
              <cbitpos>47</cbitpos>
              <reducedPhysBits>1</reducedPhysBits>
              <maxGuests>15</maxGuests>
              <maxESGuests>0</maxESGuests>
            </sev>
            <tdx supported='no'/>
          </features>
        </domainCapabilities>"#;

    #[test]
    fn parses_modes_models_and_features() {
        let caps = parse_domain_capabilities(FULL.as_bytes()).unwrap();
        assert_eq!(caps.machine.as_deref(), Some("pc-q35-7.2"));
        assert_eq!(caps.modes().len(), 3);

        let host_model = caps.host_model_mode().unwrap();
        assert_eq!(host_model.vendor_name(), "Intel");
        assert_eq!(host_model.models[0].name(), "Skylake-Client-IBRS");
        assert_eq!(
            host_model.models[0].fallback.as_deref(),
            Some("forbid")
        );
        assert_eq!(host_model.features.len(), 2);

        let custom = &caps.modes()[2];
        assert_eq!(custom.models.len(), 3);
        // No semantic validation here: usable='maybe' parses verbatim.
        assert_eq!(custom.models[2].usable, "maybe");

        let sev = caps.features.sev.as_ref().unwrap();
        assert!(sev.is_supported());
        assert!(!sev.supports_es());
        assert_eq!(sev.cbitpos, Some(47));
        assert!(!caps.features.tdx.as_ref().unwrap().is_supported());
        assert!(caps.features.sev_snp.is_none());
        assert!(caps.features.s390_pv.is_none());
    }

    #[test]
    fn absent_optional_elements_default_to_unsupported() {
        let caps = parse_domain_capabilities(
            b"<domainCapabilities><cpu/></domainCapabilities>",
        )
        .unwrap();
        assert!(caps.modes().is_empty());
        assert!(caps.features.sev.is_none());
        assert!(caps.machine.is_none());
    }

    #[test]
    fn missing_policy_attribute_parses_as_none() {
        let caps = parse_domain_capabilities(
            br#"<domainCapabilities><cpu>
                 <mode name='host-model' supported='yes'>
                   <model>gen16a-base</model>
                   <feature name='plain'/>
                 </mode>
               </cpu></domainCapabilities>"#,
        )
        .unwrap();
        let mode = caps.host_model_mode().unwrap();
        assert_eq!(mode.features[0].policy, None);
        assert_eq!(mode.features[0].name, "plain");
        assert_eq!(mode.vendor_name(), "");
    }

    #[test]
    fn malformed_xml_is_an_error() {
        assert!(parse_domain_capabilities(b"<domainCapabilities><cpu>")
            .is_err());
    }
}
