//! External process sweeping.
//!
//! Backends launched inside containers can outlive the proxy and their
//! in-memory process group. The sweeper hook runs after the internal stops on
//! unload-all and force-stops anything that slipped through.

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{info, warn};

/// Collaborator hook invoked after internal stops on the unload-all path.
#[async_trait]
pub trait ExternalProcessSweeper: Send + Sync {
    async fn sweep(&self) -> Result<()>;
}

/// Sweeps Docker containers whose name or image carries the `vllm` token,
/// killing `vllm serve` processes inside them.
pub struct DockerSweeper;

#[async_trait]
impl ExternalProcessSweeper for DockerSweeper {
    async fn sweep(&self) -> Result<()> {
        let output = Command::new("docker")
            .args(["ps", "--format", "{{.Names}}\t{{.Image}}"])
            .output()
            .await
            .context("docker ps failed")?;
        if !output.status.success() {
            anyhow::bail!("docker ps exited with {}", output.status);
        }

        let mut containers = match_vllm_containers(&String::from_utf8_lossy(&output.stdout));
        if containers.is_empty() {
            containers = vec!["vllm_node".to_string()];
        }

        for container in containers {
            let result = Command::new("docker")
                .args(["exec", &container, "bash", "-lc", r#"pkill -f "vllm serve""#])
                .output()
                .await;
            match result {
                Ok(output) => {
                    // pkill exits 1 when nothing matched
                    if output.status.success() {
                        info!(container = %container, "swept stray vllm serve process");
                    } else if output.status.code() != Some(1) {
                        warn!(
                            container = %container,
                            status = %output.status,
                            "fallback stop of vllm serve failed"
                        );
                    }
                }
                Err(e) => {
                    warn!(container = %container, error = %e, "docker exec failed");
                }
            }
        }

        Ok(())
    }
}

/// Pick containers whose name or image mentions vllm from `docker ps` output
/// formatted as `name\timage` lines.
fn match_vllm_containers(output: &str) -> Vec<String> {
    let mut containers = Vec::new();
    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut parts = line.splitn(2, '\t');
        let name = parts.next().unwrap_or("").trim();
        if name.is_empty() {
            continue;
        }
        let image = parts.next().unwrap_or("").trim().to_lowercase();
        if name.to_lowercase().contains("vllm") || image.contains("vllm") {
            containers.push(name.to_string());
        }
    }
    containers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_match_by_name_or_image() {
        let output = "vllm_node\tubuntu:22.04\n\
web\tnginx:latest\n\
worker\tregistry.local/vLLM-openai:v0.8\n";
        assert_eq!(match_vllm_containers(output), vec!["vllm_node", "worker"]);
    }

    #[test]
    fn test_empty_and_malformed_lines_skipped() {
        let output = "\n   \nlonely-no-tab\n\tvllm-image-but-no-name\n";
        assert!(match_vllm_containers(output).is_empty());
    }
}
