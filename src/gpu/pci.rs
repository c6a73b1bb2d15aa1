//! PCI device directory.
//!
//! Answers read-only questions about PCI functions on the host: class, ids,
//! a human readable description, and the two topology relations the
//! isolation classifier relies on (bridge-parent and supplier). Nothing is
//! cached; every query goes back to the host tree.

use crate::errors::{PciError, PciResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, trace};

/// Sysfs directory holding one symlink per PCI function.
pub const PCI_DEVICES_PATH: &str = "/sys/bus/pci/devices";

/// Root of the physical device hierarchy the links above resolve into.
pub const DEVICES_ROOT: &str = "/sys/devices";

/// PCI base class + subclass codes the classifier cares about.
pub mod class {
    /// VGA compatible controller
    pub const DISPLAY: u16 = 0x0300;
    /// Audio device (includes HDMI/DP audio functions on GPUs)
    pub const AUDIO: u16 = 0x0403;
    /// PCI-to-PCI bridge
    pub const BRIDGE: u16 = 0x0604;
}

/// Host assigned `domain:bus:device.function` address, e.g. `0000:01:00.0`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PciAddress(String);

impl PciAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Split into `(domain, bus, slot.function)`.
    pub fn components(&self) -> PciResult<(&str, &str, &str)> {
        let mut parts = self.0.split(':');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(domain), Some(bus), Some(slot), None) => Ok((domain, bus, slot)),
            _ => Err(PciError::MalformedAddress { address: self.0.clone() }),
        }
    }

    /// Address the way `lspci` prints it: the domain is omitted when it is 0000.
    pub fn lspci_slot(&self) -> &str {
        self.0.strip_prefix("0000:").unwrap_or(&self.0)
    }
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PciAddress {
    fn from(address: &str) -> Self {
        Self::new(address)
    }
}

impl From<String> for PciAddress {
    fn from(address: String) -> Self {
        Self(address)
    }
}

/// The device classes that matter for GPU isolation. Everything else is
/// `Other`, carrying its raw class code for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    Display,
    Audio,
    Bridge,
    Other(u16),
}

impl DeviceClass {
    pub fn from_code(code: u16) -> Self {
        match code {
            class::DISPLAY => DeviceClass::Display,
            class::AUDIO => DeviceClass::Audio,
            class::BRIDGE => DeviceClass::Bridge,
            other => DeviceClass::Other(other),
        }
    }

    /// Decode the leading four hex digits of a class code. Accepts both the
    /// `lspci -n` form (`0300`) and the sysfs form (`0x030000`).
    pub fn parse(raw: &str) -> Option<Self> {
        let digits = raw.trim();
        let digits = digits
            .strip_prefix("0x")
            .or_else(|| digits.strip_prefix("0X"))
            .unwrap_or(digits);
        let code = digits.get(..4)?;
        u16::from_str_radix(code, 16).ok().map(Self::from_code)
    }

    pub fn name(&self) -> String {
        match self {
            DeviceClass::Display => "VGA compatible controller".to_string(),
            DeviceClass::Audio => "Audio device".to_string(),
            DeviceClass::Bridge => "PCI bridge".to_string(),
            DeviceClass::Other(code) => format!("Class {:04x}", code),
        }
    }
}

/// Snapshot of one PCI function, read at query time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PciDevice {
    pub address: PciAddress,
    pub class: DeviceClass,
    /// `vendor:device` hex pair, e.g. `10de:2204`
    pub vendor_device_id: String,
    pub description: String,
}

/// Read-only queries against the host's PCI facts.
pub trait PciDirectory {
    /// Full description, e.g. `01:00.0 VGA compatible controller: NVIDIA ...`.
    fn describe_full(&self, address: &PciAddress) -> PciResult<String>;

    fn class_of(&self, address: &PciAddress) -> PciResult<DeviceClass>;

    fn vendor_device_id(&self, address: &PciAddress) -> PciResult<String>;

    /// True iff `bridge` is the PCI bridge directly upstream of `child`.
    fn is_bridge_parent_of(&self, bridge: &PciAddress, child: &PciAddress) -> PciResult<bool>;

    /// True iff `consumer` declares `supplier` as a supplier.
    fn is_supplier_of(&self, supplier: &PciAddress, consumer: &PciAddress) -> PciResult<bool>;

    /// Description without the leading `slot class: ` prefix.
    fn describe_short(&self, address: &PciAddress) -> PciResult<String> {
        let full = self.describe_full(address)?;
        Ok(match full.split_once(": ") {
            Some((_, rest)) => rest.to_string(),
            None => full,
        })
    }

    fn device(&self, address: &PciAddress) -> PciResult<PciDevice> {
        Ok(PciDevice {
            address: address.clone(),
            class: self.class_of(address)?,
            vendor_device_id: self.vendor_device_id(address)?,
            description: self.describe_full(address)?,
        })
    }
}

/// Where human readable descriptions come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DescriptionSource {
    /// Ask `lspci -s`, falling back to sysfs when it is missing or silent.
    #[default]
    Lspci,
    /// Synthesise from sysfs attributes only.
    Sysfs,
}

/// `PciDirectory` backed by sysfs, with optional `lspci` descriptions.
#[derive(Debug, Clone)]
pub struct SysfsPciDirectory {
    pci_devices_path: PathBuf,
    devices_root: PathBuf,
    description_source: DescriptionSource,
    lspci_path: PathBuf,
}

impl Default for SysfsPciDirectory {
    fn default() -> Self {
        Self::new(PCI_DEVICES_PATH, DEVICES_ROOT)
    }
}

impl SysfsPciDirectory {
    pub fn new(pci_devices_path: impl Into<PathBuf>, devices_root: impl Into<PathBuf>) -> Self {
        Self {
            pci_devices_path: pci_devices_path.into(),
            devices_root: devices_root.into(),
            description_source: DescriptionSource::default(),
            lspci_path: PathBuf::from("lspci"),
        }
    }

    pub fn with_description_source(mut self, source: DescriptionSource) -> Self {
        self.description_source = source;
        self
    }

    pub fn with_lspci_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.lspci_path = path.into();
        self
    }

    fn device_path(&self, address: &PciAddress) -> PciResult<PathBuf> {
        let path = self.pci_devices_path.join(address.as_str());
        if !path.exists() {
            return Err(PciError::Lookup { address: address.to_string() });
        }
        Ok(path)
    }

    fn read_hex_id(&self, address: &PciAddress, attribute: &str) -> PciResult<String> {
        let path = self.device_path(address)?.join(attribute);
        let raw = read_attribute(address, &path)?;
        let id = raw.trim_start_matches("0x").to_lowercase();
        if id.is_empty() || !id.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(PciError::InvalidAttribute { path, value: raw });
        }
        Ok(id)
    }

    fn lspci_description(&self, address: &PciAddress) -> Option<String> {
        let output = match Command::new(&self.lspci_path).args(["-s", address.as_str()]).output() {
            Ok(output) => output,
            Err(e) => {
                debug!(lspci = ?self.lspci_path, error = %e, "lspci unavailable, using sysfs");
                return None;
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let line = stdout.lines().next().map(str::trim).unwrap_or_default();
        if line.is_empty() {
            None
        } else {
            Some(line.to_string())
        }
    }

    fn sysfs_description(&self, address: &PciAddress) -> PciResult<String> {
        Ok(format!(
            "{} {}: Device {}",
            address.lspci_slot(),
            self.class_of(address)?.name(),
            self.vendor_device_id(address)?
        ))
    }
}

impl PciDirectory for SysfsPciDirectory {
    fn describe_full(&self, address: &PciAddress) -> PciResult<String> {
        self.device_path(address)?;

        if self.description_source == DescriptionSource::Lspci {
            if let Some(description) = self.lspci_description(address) {
                return Ok(description);
            }
        }
        self.sysfs_description(address)
    }

    fn class_of(&self, address: &PciAddress) -> PciResult<DeviceClass> {
        let path = self.device_path(address)?.join("class");
        let raw = read_attribute(address, &path)?;
        let class = DeviceClass::parse(&raw)
            .ok_or_else(|| PciError::InvalidAttribute { path, value: raw })?;

        trace!(address = %address, class = ?class, "Read PCI class");
        Ok(class)
    }

    fn vendor_device_id(&self, address: &PciAddress) -> PciResult<String> {
        let vendor = self.read_hex_id(address, "vendor")?;
        let device = self.read_hex_id(address, "device")?;
        Ok(format!("{}:{}", vendor, device))
    }

    fn is_bridge_parent_of(&self, bridge: &PciAddress, child: &PciAddress) -> PciResult<bool> {
        let (domain, bus, _) = bridge.components()?;

        let link = self.pci_devices_path.join(child.as_str());
        let actual = fs::canonicalize(&link).map_err(|e| match e.kind() {
            ErrorKind::NotFound => PciError::Lookup { address: child.to_string() },
            _ => PciError::Io { path: link.clone(), source: e },
        })?;

        // Compare canonical forms so a symlinked root does not break the match.
        let root = fs::canonicalize(&self.devices_root).unwrap_or_else(|_| self.devices_root.clone());
        let expected = root
            .join(format!("pci{}:{}", domain, bus))
            .join(bridge.as_str())
            .join(child.as_str());

        let is_parent = actual == expected;
        debug!(
            bridge = %bridge,
            child = %child,
            actual = ?actual,
            expected = ?expected,
            is_parent,
            "Checked bridge parent"
        );
        Ok(is_parent)
    }

    fn is_supplier_of(&self, supplier: &PciAddress, consumer: &PciAddress) -> PciResult<bool> {
        let marker = self
            .device_path(consumer)?
            .join(format!("supplier:pci:{}", supplier));
        let is_supplier = marker.exists();

        debug!(supplier = %supplier, consumer = %consumer, is_supplier, "Checked supplier link");
        Ok(is_supplier)
    }
}

/// Read a value from a sysfs file. A file that vanished means the device did.
fn read_attribute(address: &PciAddress, path: &Path) -> PciResult<String> {
    fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .map_err(|e| match e.kind() {
            ErrorKind::NotFound => PciError::Lookup { address: address.to_string() },
            _ => PciError::Io { path: path.to_path_buf(), source: e },
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_decoding() {
        assert_eq!(DeviceClass::parse("0x030000"), Some(DeviceClass::Display));
        assert_eq!(DeviceClass::parse("0403"), Some(DeviceClass::Audio));
        assert_eq!(DeviceClass::parse("0x060400\n"), Some(DeviceClass::Bridge));
        assert_eq!(DeviceClass::parse("0x0c0330"), Some(DeviceClass::Other(0x0c03)));

        // 3D controllers are not VGA compatible
        assert_eq!(DeviceClass::parse("0x030200"), Some(DeviceClass::Other(0x0302)));

        assert_eq!(DeviceClass::parse("0x03"), None);
        assert_eq!(DeviceClass::parse("zzzz"), None);
    }

    #[test]
    fn test_address_components() {
        let bridge = PciAddress::from("0000:00:01.0");
        assert_eq!(bridge.components().unwrap(), ("0000", "00", "01.0"));

        for bad in ["00:01.0", "0000:00:01:0.0", "garbage"] {
            let err = PciAddress::from(bad).components().unwrap_err();
            assert!(matches!(err, PciError::MalformedAddress { ref address } if address == bad));
        }
    }

    #[test]
    fn test_lspci_slot() {
        assert_eq!(PciAddress::from("0000:01:00.0").lspci_slot(), "01:00.0");
        assert_eq!(PciAddress::from("0001:01:00.0").lspci_slot(), "0001:01:00.0");
    }

    struct FixedDescription(&'static str);

    impl PciDirectory for FixedDescription {
        fn describe_full(&self, _: &PciAddress) -> PciResult<String> {
            Ok(self.0.to_string())
        }
        fn class_of(&self, _: &PciAddress) -> PciResult<DeviceClass> {
            Ok(DeviceClass::Display)
        }
        fn vendor_device_id(&self, _: &PciAddress) -> PciResult<String> {
            Ok("10de:2204".to_string())
        }
        fn is_bridge_parent_of(&self, _: &PciAddress, _: &PciAddress) -> PciResult<bool> {
            Ok(false)
        }
        fn is_supplier_of(&self, _: &PciAddress, _: &PciAddress) -> PciResult<bool> {
            Ok(false)
        }
    }

    #[test]
    fn test_short_description_strips_prefix() {
        let dir = FixedDescription("01:00.0 VGA compatible controller: NVIDIA Corporation GA102 [GeForce RTX 3090]");
        let short = dir.describe_short(&"0000:01:00.0".into()).unwrap();
        assert_eq!(short, "NVIDIA Corporation GA102 [GeForce RTX 3090]");

        let bare = FixedDescription("no prefix here");
        assert_eq!(bare.describe_short(&"0000:01:00.0".into()).unwrap(), "no prefix here");
    }
}
