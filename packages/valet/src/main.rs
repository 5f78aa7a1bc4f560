fn main() {
    if let Err(err) = valet::cli::run_valet() {
        tracing::error!(error = %err, "valet failed");
        std::process::exit(1);
    }
}
