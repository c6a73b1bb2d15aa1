use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WizardError {
    #[error("PCI Error: {0}")]
    PciError(#[from] PciError),

    #[error("Configuration Error: {0}")]
    ConfigError(#[from] config::ConfigError),

    #[error("Terminal Error: {0}")]
    TerminalError(#[from] std::io::Error),

    #[error("Serialization Error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// Failures while reading PCI and IOMMU facts from the host.
#[derive(Error, Debug)]
pub enum PciError {
    #[error("PCI device not found: {address}")]
    Lookup { address: String },

    #[error("Cannot parse PCI bridge device: '{address}'")]
    MalformedAddress { address: String },

    #[error("Failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid value {value:?} in {path:?}")]
    InvalidAttribute { path: PathBuf, value: String },
}

impl PciError {
    /// Errors tied to one device's attributes. They only spoil the group
    /// being classified; a malformed address means the topology source
    /// itself is unusable.
    pub fn is_device_scoped(&self) -> bool {
        matches!(
            self,
            PciError::Lookup { .. } | PciError::Io { .. } | PciError::InvalidAttribute { .. }
        )
    }
}

// Result type alias for convenience
pub type WizardResult<T> = Result<T, WizardError>;
pub type PciResult<T> = Result<T, PciError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_errors_are_distinguished_from_malformed() {
        let lookup = PciError::Lookup { address: "0000:09:00.0".into() };
        let invalid = PciError::InvalidAttribute {
            path: PathBuf::from("/sys/bus/pci/devices/0000:05:00.0/class"),
            value: "garbage".into(),
        };
        let malformed = PciError::MalformedAddress { address: "bogus".into() };

        assert!(lookup.is_device_scoped());
        assert!(invalid.is_device_scoped());
        assert!(!malformed.is_device_scoped());
        assert_eq!(
            malformed.to_string(),
            "Cannot parse PCI bridge device: 'bogus'"
        );
    }

    #[test]
    fn pci_errors_convert_into_wizard_errors() {
        let err: WizardError = PciError::Lookup { address: "0000:01:00.0".into() }.into();
        assert_eq!(err.to_string(), "PCI Error: PCI device not found: 0000:01:00.0");
    }
}
