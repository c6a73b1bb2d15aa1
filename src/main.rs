fn main() -> anyhow::Result<()> {
    // Logging is set up by the CLI once verbosity flags are parsed.
    vfio_gpu_wizard::cli::run()
}
