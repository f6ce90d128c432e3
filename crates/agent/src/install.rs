//! In-band dependency installer invoked by the `install` RPC while a
//! snapshot is being baked. Prefers `uv pip install` and falls back to the
//! system `pip` when `uv` isn't on the image.

use std::process::Output;
use std::time::Duration;

use shared::rpc::RemoteError;

use crate::constants::{INSTALL_OUTPUT_TAIL_BYTES, INSTALL_TIMEOUT_SECS};

pub async fn install_dependencies(dependencies: Vec<String>) -> Result<(), RemoteError> {
    if dependencies.is_empty() {
        return Ok(());
    }

    let uv_args = ["pip", "install", "--system", "--no-progress"];
    match run_installer("uv", &uv_args, &dependencies).await {
        Ok(output) if output.status.success() => Ok(()),
        Ok(output) => Err(installer_failed("uv pip", &output)),
        Err(_not_found) => {
            let pip_args = ["install", "--no-input", "--no-cache-dir"];
            match run_installer("pip", &pip_args, &dependencies).await {
                Ok(output) if output.status.success() => Ok(()),
                Ok(output) => Err(installer_failed("pip", &output)),
                Err(e) => Err(RemoteError::new("InstallError", format!("neither uv nor pip is available: {e}"))),
            }
        }
    }
}

async fn run_installer(program: &str, fixed_args: &[&str], dependencies: &[String]) -> std::io::Result<Output> {
    let mut command = tokio::process::Command::new(program);
    command.args(fixed_args).args(dependencies).kill_on_drop(true);

    match tokio::time::timeout(Duration::from_secs(INSTALL_TIMEOUT_SECS), command.output()).await {
        Ok(result) => result,
        Err(_elapsed) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("{program} install exceeded {INSTALL_TIMEOUT_SECS}s"),
        )),
    }
}

fn installer_failed(program: &str, output: &Output) -> RemoteError {
    let combined = format!(
        "stdout:\n{}\nstderr:\n{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    let tail = tail_bytes(&combined, INSTALL_OUTPUT_TAIL_BYTES);
    RemoteError::new("InstallError", format!("{program} exited with {}: {tail}", output.status))
}

fn tail_bytes(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let start = s.len() - max;
    let boundary = (start..s.len()).find(|&i| s.is_char_boundary(i)).unwrap_or(start);
    s[boundary..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_bytes_truncates_from_the_front() {
        let long = "a".repeat(1000);
        let tail = tail_bytes(&long, 10);
        assert_eq!(tail.len(), 10);
    }

    #[test]
    fn tail_bytes_is_a_no_op_under_the_limit() {
        assert_eq!(tail_bytes("short", 500), "short");
    }
}
