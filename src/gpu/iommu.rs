//! IOMMU group enumeration.
//!
//! IOMMU groups are the smallest unit of device isolation: every device in a
//! group shares one DMA domain and has to be handed to a guest together.
//! Groups are read-only input here, the kernel owns them.

use crate::errors::{PciError, PciResult};
use crate::gpu::pci::PciAddress;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Path to IOMMU groups in sysfs.
pub const IOMMU_GROUPS_PATH: &str = "/sys/kernel/iommu_groups";

/// Lists IOMMU groups and their member PCI functions.
pub trait IommuTopology {
    /// Group ids in ascending numeric order. Empty when the host exposes no
    /// IOMMU grouping at all.
    fn list_groups(&self) -> PciResult<Vec<u32>>;

    /// Member addresses of a group. Empty when the group lists no devices.
    fn members_of(&self, group_id: u32) -> PciResult<BTreeSet<PciAddress>>;
}

#[derive(Debug, Clone)]
pub struct SysfsIommuTopology {
    iommu_groups_path: PathBuf,
}

impl Default for SysfsIommuTopology {
    fn default() -> Self {
        Self::new(IOMMU_GROUPS_PATH)
    }
}

impl SysfsIommuTopology {
    pub fn new(iommu_groups_path: impl Into<PathBuf>) -> Self {
        Self { iommu_groups_path: iommu_groups_path.into() }
    }

    /// IOMMU is considered enabled when the kernel publishes the groups tree.
    pub fn is_iommu_enabled(&self) -> bool {
        self.iommu_groups_path.exists()
    }
}

impl IommuTopology for SysfsIommuTopology {
    fn list_groups(&self) -> PciResult<Vec<u32>> {
        if !self.is_iommu_enabled() {
            debug!(path = ?self.iommu_groups_path, "No IOMMU groups published");
            return Ok(Vec::new());
        }

        let mut groups = Vec::new();
        for name in read_dir_names(&self.iommu_groups_path)? {
            match name.parse::<u32>() {
                Ok(id) => groups.push(id),
                Err(_) => warn!(entry = %name, "Ignoring non-numeric IOMMU group entry"),
            }
        }

        groups.sort_unstable();
        debug!(count = groups.len(), "Listed IOMMU groups");
        Ok(groups)
    }

    fn members_of(&self, group_id: u32) -> PciResult<BTreeSet<PciAddress>> {
        let devices_path = self.iommu_groups_path.join(group_id.to_string()).join("devices");
        if !devices_path.exists() {
            return Ok(BTreeSet::new());
        }

        let members: BTreeSet<PciAddress> = read_dir_names(&devices_path)?
            .into_iter()
            .map(PciAddress::from)
            .collect();

        debug!(group_id, devices = ?members, "Read IOMMU group");
        Ok(members)
    }
}

fn read_dir_names(path: &Path) -> PciResult<Vec<String>> {
    let io_err = |e| PciError::Io { path: path.to_path_buf(), source: e };

    let mut names = Vec::new();
    for entry in fs::read_dir(path).map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_root_means_no_groups() {
        let topology = SysfsIommuTopology::new("/nonexistent/iommu_groups");
        assert!(!topology.is_iommu_enabled());
        assert!(topology.list_groups().unwrap().is_empty());
        assert!(topology.members_of(0).unwrap().is_empty());
    }
}
