pub mod shutdown;

/// Process-wide setup shared by the controller binary. Installs the rustls crypto
/// provider the `kube` client needs to talk TLS to the API server, and lets
/// `DISABLE_COLORS` turn off `owo-colors` output when running under a log collector
/// that doesn't render ANSI.
pub fn init() {
    let disable_colors = ["1", "true"].contains(
        &std::env::var("DISABLE_COLORS")
            .unwrap_or_default()
            .to_lowercase()
            .as_str(),
    );
    owo_colors::set_override(!disable_colors);
    install_rustls_provider();
}

fn install_rustls_provider() {
    // Only one provider may be installed per process; ignore the error if a previous
    // call (or another crate) already installed one.
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

/// Writes the readiness marker file consumed by the container's readiness probe.
pub fn signal_ready() {
    let path = std::env::var("READY_FILE").unwrap_or_else(|_| "/tmp/ready".to_string());
    if let Err(e) = std::fs::write(&path, "ready") {
        eprintln!("failed to write readiness file {path}: {e}");
    }
}
