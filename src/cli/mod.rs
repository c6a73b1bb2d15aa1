/*
* VFIO GPU Wizard Command Line Interface
* --------------------------------------
*
* vfio-gpu-wizard
* ├── select (default)   // interactive: confirm, then pick a compatible GPU
* ├── scan [--json]      // print compatible GPUs and groups with bad isolation
* └── init [--force]     // write config/default.toml
*
* Global flags:
*   --config <FILE>          explicit settings file
*   --relax-gpu-isolation    let the GPU's parent PCI bridge share its group
*   -v / -vv / -vvv          log level (RUST_LOG wins when set)
*/

use clap::{ArgAction, Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::config::Settings;
use crate::dashboard::{self, SelectionOutcome};
use crate::errors::WizardResult;
use crate::gpu::{Classification, IsolationClassifier, PciDirectory};

#[derive(Parser)]
#[command(name = "vfio-gpu-wizard")]
#[command(about = "Find GPUs that can be passed through to a VM with VFIO", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[arg(short, long, value_name = "CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Relax GPU isolation. For example, allow the PCI bridge the GPU is
    /// connected to in the same IOMMU group.
    #[arg(long, global = true)]
    relax_gpu_isolation: bool,

    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Interactively select a GPU for passthrough
    Select,
    /// List GPUs and their IOMMU isolation status
    Scan {
        #[arg(long)]
        json: bool,
    },
    /// Generate default configuration
    Init {
        #[arg(short, long)]
        force: bool,
    },
}

pub fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut settings = match &cli.config {
        Some(path) => Settings::new_from_file(path)?,
        None => Settings::new()?,
    };
    if cli.relax_gpu_isolation {
        settings.isolation.allow_bridge_in_group = true;
    }

    match cli.command.unwrap_or(Commands::Select) {
        Commands::Select => handle_select_command(&settings)?,
        Commands::Scan { json } => handle_scan_command(&settings, json)?,
        Commands::Init { force } => handle_init_command(force)?,
    }

    Ok(())
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

pub fn classify(settings: &Settings) -> WizardResult<Classification> {
    let directory = settings.pci_directory();
    let topology = settings.iommu_topology();

    info!(policy = ?settings.isolation, "Scanning IOMMU groups");
    let classification = IsolationClassifier::new(&directory, &topology, settings.isolation)
        .classify_all()?;
    Ok(classification)
}

fn handle_scan_command(settings: &Settings, json: bool) -> anyhow::Result<()> {
    let classification = classify(settings)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&classification)?);
        return Ok(());
    }

    let directory = settings.pci_directory();
    let iommu_enabled = settings.iommu_topology().is_iommu_enabled();
    print!("{}", render_report(&classification, &directory, iommu_enabled)?);
    Ok(())
}

fn handle_select_command(settings: &Settings) -> anyhow::Result<()> {
    let classification = classify(settings)?;

    match dashboard::run_selection(&classification)? {
        SelectionOutcome::Selected(gpu) => {
            println!(
                "{} Selected GPU: {} (VFIO: {})",
                "✓".green(),
                gpu.slot,
                gpu.vfio
            );
        }
        SelectionOutcome::NoCompatibleGpu => {
            let directory = settings.pci_directory();
            let iommu_enabled = settings.iommu_topology().is_iommu_enabled();
            print!("{}", render_report(&classification, &directory, iommu_enabled)?);
        }
        SelectionOutcome::Cancelled => println!("No GPU selected."),
        SelectionOutcome::Declined => println!("No GPU selection."),
    }

    Ok(())
}

/// Human readable scan report.
pub fn render_report<D: PciDirectory + ?Sized>(
    classification: &Classification,
    directory: &D,
    iommu_enabled: bool,
) -> WizardResult<String> {
    let mut lines = Vec::new();

    if classification.has_compatible() {
        lines.push("Compatible GPUs:".bold().to_string());
        for gpu in &classification.compatible {
            lines.push(format!(
                "- {} [{}] {} (IOMMU group {})",
                gpu.slot.to_string().cyan(),
                gpu.vfio.green(),
                directory.describe_short(&gpu.slot)?,
                gpu.iommu_group
            ));
        }
    }

    for (group_id, group) in &classification.bad_isolation {
        if group.devices.is_empty() {
            continue;
        }
        let header = format!("IOMMU Group '{}' has bad isolation:", group_id);
        lines.push(format!("\n{}", header.yellow()));
        lines.extend(group.devices.iter().map(|device| format!("  {}", device)));
    }

    for (group_id, reason) in &classification.unreadable {
        let header = format!("IOMMU Group '{}' could not be read:", group_id);
        lines.push(format!("\n{} {}", header.red(), reason));
    }

    if !classification.has_compatible() {
        if !iommu_enabled {
            lines.push(
                "IOMMU is not enabled. Enable VT-d/AMD-Vi in BIOS and add 'intel_iommu=on' \
                 or 'amd_iommu=on' to the kernel command line."
                    .yellow()
                    .to_string(),
            );
        }
        lines.push(format!("\n{}", "No compatible GPU available.".red()));
    }

    let mut out = lines.join("\n");
    if !out.is_empty() {
        out.push('\n');
    }
    Ok(out)
}

fn handle_init_command(force: bool) -> anyhow::Result<()> {
    let config_dir = PathBuf::from("config");
    let target = config_dir.join("default.toml");
    if target.exists() && !force {
        error!("Configuration file already exists. Use --force to overwrite.");
        return Ok(());
    }

    std::fs::create_dir_all(&config_dir)?;
    let default_config = crate::config::generate_default_config();
    let config_str = toml::to_string_pretty(&default_config)?;
    std::fs::write(&target, config_str)?;

    println!("{} Default configuration generated", "✓".green());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{BadIsolationGroup, CompatibleGpu, DeviceClass, PciAddress};
    use crate::errors::PciResult;

    struct Lspci;

    impl PciDirectory for Lspci {
        fn describe_full(&self, address: &PciAddress) -> PciResult<String> {
            Ok(format!("{} VGA compatible controller: NVIDIA GA102", address.lspci_slot()))
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
            Ok(true)
        }
    }

    #[test]
    fn test_cli_flags_parse() {
        let cli = Cli::try_parse_from(["vfio-gpu-wizard", "scan", "--json", "--relax-gpu-isolation", "-vv"])
            .unwrap();
        assert!(cli.relax_gpu_isolation);
        assert_eq!(cli.verbose, 2);
        assert!(matches!(cli.command, Some(Commands::Scan { json: true })));

        let cli = Cli::try_parse_from(["vfio-gpu-wizard"]).unwrap();
        assert!(cli.command.is_none());
        assert!(!cli.relax_gpu_isolation);
    }

    #[test]
    fn test_report_lists_gpus_and_bad_groups() {
        colored::control::set_override(false);

        let mut classification = Classification {
            compatible: vec![CompatibleGpu {
                description: "01:00.0 VGA compatible controller: NVIDIA GA102".to_string(),
                slot: PciAddress::from("0000:01:00.0"),
                devices: vec![PciAddress::from("0000:01:00.0"), PciAddress::from("0000:01:00.1")],
                vfio: "10de:2204,10de:1aef".to_string(),
                iommu_group: 14,
            }],
            ..Default::default()
        };
        classification.bad_isolation.insert(
            16,
            BadIsolationGroup {
                group_id: 16,
                devices: vec!["08:00.0 VGA compatible controller: ASPEED".to_string()],
            },
        );

        let report = render_report(&classification, &Lspci, true).unwrap();
        assert!(report.contains("- 0000:01:00.0 [10de:2204,10de:1aef] NVIDIA GA102 (IOMMU group 14)"));
        assert!(report.contains("IOMMU Group '16' has bad isolation:"));
        assert!(report.contains("  08:00.0 VGA compatible controller: ASPEED"));
        assert!(!report.contains("No compatible GPU available."));
    }

    #[test]
    fn test_report_without_gpus() {
        colored::control::set_override(false);

        let report = render_report(&Classification::default(), &Lspci, false).unwrap();
        assert!(report.contains("IOMMU is not enabled"));
        assert!(report.ends_with("No compatible GPU available.\n"));
    }

    #[test]
    fn test_report_lists_unreadable_groups() {
        colored::control::set_override(false);

        let mut classification = Classification::default();
        classification
            .unreadable
            .insert(30, "Invalid value \"garbage\" in \"class\"".to_string());

        let report = render_report(&classification, &Lspci, true).unwrap();
        assert_eq!(
            report,
            "\nIOMMU Group '30' could not be read: Invalid value \"garbage\" in \"class\"\n\
             \nNo compatible GPU available.\n"
        );
    }
}
