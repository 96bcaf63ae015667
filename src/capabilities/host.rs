use serde::Deserialize;

/// Parsed `<capabilities>` document: host counters, NUMA topology and the
/// guest machine types the hypervisor can run.
#[derive(Debug, Default, Deserialize)]
pub struct HostCapabilities {
    #[serde(default)]
    pub host: HostSection,
    #[serde(rename = "guest", default)]
    pub guests: Vec<GuestSection>,
}

impl HostCapabilities {
    /// The TSC counter descriptor, when the host reports one.
    pub fn tsc_counter(&self) -> Option<&Counter> {
        self.host
            .cpu
            .counters
            .iter()
            .find(|c| c.name == "tsc")
    }

    /// All supported guest machine type names, deduplicated, in document
    /// order.
    pub fn machine_types(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        let mut machines = Vec::new();
        for guest in &self.guests {
            let Some(arch) = &guest.arch else { continue };
            for machine in &arch.machines {
                let name = machine.name.trim();
                if !name.is_empty() && seen.insert(name.to_string()) {
                    machines.push(name.to_string());
                }
            }
        }
        machines
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct HostSection {
    #[serde(default)]
    pub cpu: HostCpu,
    #[serde(default)]
    pub topology: Option<Topology>,
}

#[derive(Debug, Default, Deserialize)]
pub struct HostCpu {
    #[serde(rename = "counter", default)]
    pub counters: Vec<Counter>,
}

/// `<counter name='tsc' frequency='2499998000' scaling='no'/>`
#[derive(Debug, Default, Deserialize)]
pub struct Counter {
    #[serde(rename = "@name", default)]
    pub name: String,
    #[serde(rename = "@frequency", default)]
    pub frequency: Option<i64>,
    #[serde(rename = "@scaling", default)]
    pub scaling: Option<String>,
}

impl Counter {
    pub fn is_scalable(&self) -> bool {
        self.scaling.as_deref() == Some("yes")
    }
}

/// NUMA cell topology; only the shape is retained.
#[derive(Debug, Default, Deserialize)]
pub struct Topology {
    #[serde(default)]
    pub cells: Option<Cells>,
}

#[derive(Debug, Default, Deserialize)]
pub struct Cells {
    #[serde(rename = "@num", default)]
    pub num: u32,
    #[serde(rename = "cell", default)]
    pub cells: Vec<Cell>,
}

#[derive(Debug, Default, Deserialize)]
pub struct Cell {
    #[serde(rename = "@id", default)]
    pub id: u32,
}

#[derive(Debug, Default, Deserialize)]
pub struct GuestSection {
    #[serde(default)]
    pub os_type: Option<String>,
    #[serde(default)]
    pub arch: Option<GuestArch>,
}

#[derive(Debug, Default, Deserialize)]
pub struct GuestArch {
    #[serde(rename = "@name", default)]
    pub name: String,
    #[serde(rename = "machine", default)]
    pub machines: Vec<MachineEntry>,
}

/// `<machine maxCpus='288' canonical='pc'>pc-i440fx-7.2</machine>`
#[derive(Debug, Default, Deserialize)]
pub struct MachineEntry {
    #[serde(rename = "@canonical", default)]
    pub canonical: Option<String>,
    #[serde(rename = "@maxCpus", default)]
    pub max_cpus: Option<u32>,
    #[serde(rename = "$text", default)]
    pub name: String,
}

#[cfg(test)]
mod tests {
    use crate::capabilities::parse_host_capabilities;

    const DOC: &str = r#"
        <capabilities>
          <host>
            <cpu>
              <arch>x86_64</arch>
              <counter name='tsc' frequency='2499998000' scaling='no'/>
            </cpu>
            <topology>
              <cells num='2'>
                <cell id='0'/>
                <cell id='1'/>
              </cells>
            </topology>
          </host>
          <guest>
            <os_type>hvm</os_type>
            <arch name='x86_64'>
              <machine maxCpus='288'>pc-i440fx-7.2</machine>
              <machine canonical='pc-i440fx-7.2'>pc</machine>
              <machine maxCpus='710'>pc-q35-7.2</machine>
            </arch>
          </guest>
          <guest>
            <os_type>hvm</os_type>
            <arch name='i686'>
              <machine maxCpus='288'>pc-i440fx-7.2</machine>
            </arch>
          </guest>
        </capabilities>"#;

    #[test]
    fn parses_tsc_counter() {
        let caps = parse_host_capabilities(DOC.as_bytes()).unwrap();
        let tsc = caps.tsc_counter().unwrap();
        assert_eq!(tsc.frequency, Some(2499998000));
        assert!(!tsc.is_scalable());
        assert_eq!(
            caps.host.topology.as_ref().unwrap().cells.as_ref().unwrap().num,
            2
        );
    }

    #[test]
    fn machine_types_are_deduplicated_across_guests() {
        let caps = parse_host_capabilities(DOC.as_bytes()).unwrap();
        assert_eq!(
            caps.machine_types(),
            vec!["pc-i440fx-7.2", "pc", "pc-q35-7.2"]
        );
    }

    #[test]
    fn missing_counter_is_not_an_error() {
        let caps = parse_host_capabilities(
            b"<capabilities><host><cpu/></host></capabilities>",
        )
        .unwrap();
        assert!(caps.tsc_counter().is_none());
        assert!(caps.machine_types().is_empty());
    }
}
