pub mod iommu;
pub mod isolation;
pub mod pci;

// exports so callers don't need the full paths
pub use iommu::{IommuTopology, SysfsIommuTopology};
pub use isolation::{
    BadIsolationGroup, Classification, CompatibleGpu, GroupVerdict, IsolationClassifier,
    IsolationPolicy,
};
pub use pci::{DescriptionSource, DeviceClass, PciAddress, PciDevice, PciDirectory, SysfsPciDirectory};
