//! Hyper-V enlightenment scan against the KVM device node.
//!
//! Several enlightenments are only observable through direct
//! `KVM_CHECK_EXTENSION` and synthetic-register-enumeration calls, not
//! through the capability XML. The scan opens the device read-write, lists
//! the supported synthetic registers (growing the buffer once if the kernel
//! reports it too small) and then walks a fixed capability table. Any
//! failure yields an empty set: nodes without hardware virtualization
//! support are an expected condition and must not fail the cycle.

use std::collections::{BTreeSet, HashSet};
use std::fs::OpenOptions;
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use tracing::{debug, warn};

const KVM_GET_MSR_INDEX_LIST: u64 = 0xC004_AE02;
const KVM_CHECK_EXTENSION: u64 = 0xAE03;

const KVM_CAP_HYPERV: u32 = 44;
const KVM_CAP_HYPERV_TIME: u32 = 96;
const KVM_CAP_HYPERV_SYNIC: u32 = 123;
const KVM_CAP_HYPERV_SYNIC2: u32 = 148;
const KVM_CAP_HYPERV_VP_INDEX: u32 = 149;
const KVM_CAP_HYPERV_TLBFLUSH: u32 = 155;
const KVM_CAP_HYPERV_SEND_IPI: u32 = 161;

const HV_X64_MSR_RESET: u32 = 0x4000_0003;
const HV_X64_MSR_VP_RUNTIME: u32 = 0x4000_0010;
const HV_X64_MSR_TSC_FREQUENCY: u32 = 0x4000_0022;
const HV_X64_MSR_STIMER0_CONFIG: u32 = 0x4000_00B0;
const HV_X64_MSR_REENLIGHTENMENT_CONTROL: u32 = 0x4000_0106;

/// How a table entry is probed: a `KVM_CHECK_EXTENSION` capability number
/// or a synthetic-register index from the MSR index list.
#[derive(Debug, Clone, Copy)]
pub enum HypervProbe {
    Extension(u32),
    Register(u32),
}

pub struct HypervCapability {
    pub name: &'static str,
    pub probe: HypervProbe,
}

/// The enlightenments this controller advertises, in their canonical order.
pub const HYPERV_CAPABILITIES: &[HypervCapability] = &[
    HypervCapability { name: "base", probe: HypervProbe::Extension(KVM_CAP_HYPERV) },
    HypervCapability { name: "time", probe: HypervProbe::Extension(KVM_CAP_HYPERV_TIME) },
    HypervCapability { name: "vpindex", probe: HypervProbe::Extension(KVM_CAP_HYPERV_VP_INDEX) },
    HypervCapability { name: "tlbflush", probe: HypervProbe::Extension(KVM_CAP_HYPERV_TLBFLUSH) },
    HypervCapability { name: "ipi", probe: HypervProbe::Extension(KVM_CAP_HYPERV_SEND_IPI) },
    HypervCapability { name: "synic", probe: HypervProbe::Extension(KVM_CAP_HYPERV_SYNIC) },
    HypervCapability { name: "synic2", probe: HypervProbe::Extension(KVM_CAP_HYPERV_SYNIC2) },
    HypervCapability { name: "frequencies", probe: HypervProbe::Register(HV_X64_MSR_TSC_FREQUENCY) },
    HypervCapability { name: "reset", probe: HypervProbe::Register(HV_X64_MSR_RESET) },
    HypervCapability { name: "runtime", probe: HypervProbe::Register(HV_X64_MSR_VP_RUNTIME) },
    HypervCapability { name: "synictimer", probe: HypervProbe::Register(HV_X64_MSR_STIMER0_CONFIG) },
    HypervCapability { name: "reenlightenment", probe: HypervProbe::Register(HV_X64_MSR_REENLIGHTENMENT_CONTROL) },
];

/// Scan the device node for exposed Hyper-V enlightenments. Never fails:
/// any open or ioctl error is logged and degrades to an empty set.
pub fn scan(device: &Path) -> BTreeSet<String> {
    match scan_device(device) {
        Ok(exposed) => exposed,
        Err(err) => {
            warn!(device = %device.display(), error = %err,
                "hyperv scan unavailable; advertising no enlightenments");
            BTreeSet::new()
        }
    }
}

fn scan_device(device: &Path) -> io::Result<BTreeSet<String>> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_CLOEXEC)
        .open(device)?;
    let fd = file.as_raw_fd();

    let registers = supported_registers(fd)?;
    debug!(count = registers.len(), "enumerated synthetic registers");

    let check = |cap: u32| unsafe {
        libc::ioctl(fd, KVM_CHECK_EXTENSION as _, cap as libc::c_ulong)
    };
    Ok(exposed_capabilities(check, &registers))
}

/// Enumerate the synthetic registers the kernel supports. The exchange
/// buffer is a fixed header (register count) followed by a growable array
/// of 32-bit indices; when the kernel reports the buffer too small it
/// writes the required count into the header, and we retry exactly once at
/// that size.
fn supported_registers(fd: libc::c_int) -> io::Result<HashSet<u32>> {
    let mut buf: Vec<u32> = vec![0];
    let rc = unsafe {
        libc::ioctl(fd, KVM_GET_MSR_INDEX_LIST as _, buf.as_mut_ptr())
    };
    if rc == 0 {
        return Ok(HashSet::new());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() != Some(libc::E2BIG) {
        return Err(err);
    }

    let count = buf[0] as usize;
    let mut buf: Vec<u32> = vec![0; count + 1];
    buf[0] = count as u32;
    let rc = unsafe {
        libc::ioctl(fd, KVM_GET_MSR_INDEX_LIST as _, buf.as_mut_ptr())
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    let returned = (buf[0] as usize).min(count);
    Ok(buf[1..1 + returned].iter().copied().collect())
}

/// Decide exposure for every table entry. Extension-tied entries are
/// exposed iff the extension check returns a positive value; register-tied
/// entries iff the register index was enumerated. Absent or uncertain
/// means not exposed.
pub fn exposed_capabilities(
    mut check_extension: impl FnMut(u32) -> libc::c_int,
    registers: &HashSet<u32>,
) -> BTreeSet<String> {
    HYPERV_CAPABILITIES
        .iter()
        .filter(|cap| match cap.probe {
            HypervProbe::Extension(number) => check_extension(number) > 0,
            HypervProbe::Register(index) => registers.contains(&index),
        })
        .map(|cap| cap.name.to_string())
        .collect()
}
