pub mod cli;
pub mod config;
pub mod dashboard;
pub mod errors;
pub mod gpu;

// Re-exports
pub use config::Settings;
pub use errors::{PciError, WizardError, WizardResult};
pub use gpu::{
    BadIsolationGroup, Classification, CompatibleGpu, IsolationClassifier, IsolationPolicy,
};
