/*
* Wizard Configuration
* --------------------
* Layered settings, lowest to highest priority:
*
* 1. Hardcoded defaults (real sysfs locations, strict isolation)
* 2. <config dir>/default.{toml,json,yaml}   (optional)
* 3. <config dir>/local.{toml,json,yaml}     (optional)
* 4. Environment variables: VFIO_WIZARD_<SECTION>__<KEY>
*    e.g. VFIO_WIZARD_ISOLATION__ALLOW_BRIDGE_IN_GROUP=true
*
* The config dir is `config` unless VFIO_WIZARD_CONFIG_PATH says otherwise.
* Pointing the sysfs paths somewhere else is how the tests (and anyone
* inspecting a captured sysfs tree) run the scan off-host.
*/

use crate::gpu::iommu::{SysfsIommuTopology, IOMMU_GROUPS_PATH};
use crate::gpu::isolation::IsolationPolicy;
use crate::gpu::pci::{DescriptionSource, SysfsPciDirectory, DEVICES_ROOT, PCI_DEVICES_PATH};
use config::{Config, ConfigBuilder, ConfigError, Environment, File};
use config::builder::DefaultState;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

const ENV_PREFIX: &str = "VFIO_WIZARD";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub sysfs: SysfsSettings,
    pub lspci: LspciSettings,
    pub isolation: IsolationPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SysfsSettings {
    pub iommu_groups_path: PathBuf,
    pub pci_devices_path: PathBuf,
    pub devices_root: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LspciSettings {
    pub path: PathBuf,
    pub description_source: DescriptionSource,
}

impl Default for Settings {
    fn default() -> Self {
        generate_default_config()
    }
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let config_path = std::env::var("VFIO_WIZARD_CONFIG_PATH")
            .unwrap_or_else(|_| "config".to_string());

        info!("Loading configuration from path: {}", config_path);

        Self::defaults()?
            .add_source(File::with_name(&format!("{}/default", config_path)).required(false))
            .add_source(File::with_name(&format!("{}/local", config_path)).required(false))
            .add_source(environment())
            .build()?
            .try_deserialize()
    }

    /// Load from one explicit file on top of the defaults; the file must exist.
    pub fn new_from_file(path: &Path) -> Result<Self, ConfigError> {
        info!("Loading configuration from file: {}", path.display());

        Self::defaults()?
            .add_source(File::from(path))
            .add_source(environment())
            .build()?
            .try_deserialize()
    }

    fn defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
        Config::builder()
            .set_default("sysfs.iommu_groups_path", IOMMU_GROUPS_PATH)?
            .set_default("sysfs.pci_devices_path", PCI_DEVICES_PATH)?
            .set_default("sysfs.devices_root", DEVICES_ROOT)?
            .set_default("lspci.path", "lspci")?
            .set_default("lspci.description_source", "lspci")?
            .set_default("isolation.allow_bridge_in_group", false)
    }

    pub fn pci_directory(&self) -> SysfsPciDirectory {
        SysfsPciDirectory::new(&self.sysfs.pci_devices_path, &self.sysfs.devices_root)
            .with_description_source(self.lspci.description_source)
            .with_lspci_path(&self.lspci.path)
    }

    pub fn iommu_topology(&self) -> SysfsIommuTopology {
        SysfsIommuTopology::new(&self.sysfs.iommu_groups_path)
    }
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}

pub fn generate_default_config() -> Settings {
    Settings {
        sysfs: SysfsSettings {
            iommu_groups_path: PathBuf::from(IOMMU_GROUPS_PATH),
            pci_devices_path: PathBuf::from(PCI_DEVICES_PATH),
            devices_root: PathBuf::from(DEVICES_ROOT),
        },
        lspci: LspciSettings {
            path: PathBuf::from("lspci"),
            description_source: DescriptionSource::Lspci,
        },
        isolation: IsolationPolicy::strict(),
    }
}
