mod constants;
mod functions;
mod install;
mod seccomp;

use std::sync::Arc;

use shared::executor::{InstallFn, serve_connection};
use tokio_vsock::{VMADDR_CID_ANY, VsockAddr, VsockListener};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    if let Err(e) = seccomp::SeccompFilter::apply_basic_filter() {
        tracing::warn!(error = %e, "seccomp filter failed to load, continuing unfiltered");
    }

    let registry = Arc::new(functions::build());
    let install: InstallFn = Arc::new(|deps| Box::pin(install::install_dependencies(deps)));

    let addr = VsockAddr::new(VMADDR_CID_ANY, constants::DEFAULT_VSOCK_PORT);
    let listener = match VsockListener::bind(addr) {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(error = %e, "failed to bind vsock listener");
            std::process::exit(1);
        }
    };
    tracing::info!(port = constants::DEFAULT_VSOCK_PORT, "executor listening");

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                continue;
            }
        };
        tracing::debug!(?peer, "accepted connection");
        serve_connection(stream, registry.clone(), install.clone()).await;
        tracing::debug!(?peer, "connection closed");
    }
}
