//! Container naming and docker command construction.
//!
//! Image and container share one name derived from the build id, so the
//! debug shell can find a build's container without extra bookkeeping.

use std::path::Path;

use stagehand_state::BuildId;

use crate::runner::CommandSpec;

/// Mount point of the checked-out repository inside the container.
pub const WORKSPACE_MOUNT: &str = "/workspace";

const NAME_PREFIX: &str = "stagehand-";

/// Deterministic, docker-safe image/container name for a build.
pub fn container_name(build_id: &BuildId) -> String {
    let mut name = String::with_capacity(NAME_PREFIX.len() + build_id.as_str().len());
    name.push_str(NAME_PREFIX);
    let mut last_dash = true;
    for c in build_id.as_str().chars().flat_map(char::to_lowercase) {
        if c.is_ascii_alphanumeric() || c == '_' || c == '.' {
            name.push(c);
            last_dash = false;
        } else if !last_dash {
            name.push('-');
            last_dash = true;
        }
    }
    while name.ends_with(['-', '.', '_']) {
        name.pop();
    }
    name
}

/// Builds docker invocations for the build and test stages.
#[derive(Debug, Clone)]
pub struct ContainerManager {
    docker: String,
}

impl ContainerManager {
    pub fn new(docker: impl Into<String>) -> Self {
        Self {
            docker: docker.into(),
        }
    }

    /// `docker build -t <name> .` in the checkout.
    pub fn build_image(&self, name: &str, context: &Path) -> CommandSpec {
        CommandSpec::new("build", &self.docker)
            .args(["build", "-t", name, "."])
            .current_dir(context)
    }

    /// Start a long-lived container with the checkout mounted.
    pub fn start(&self, name: &str, workdir: &Path) -> CommandSpec {
        let volume = format!("{}:{WORKSPACE_MOUNT}", workdir.display());
        CommandSpec::new("build", &self.docker).args([
            "run",
            "-d",
            "--name",
            name,
            "-v",
            volume.as_str(),
            "-w",
            WORKSPACE_MOUNT,
            name,
            "tail",
            "-f",
            "/dev/null",
        ])
    }

    /// Run a shell script inside the build's container.
    pub fn exec(&self, name: &str, tag: &str, script: &str) -> CommandSpec {
        CommandSpec::new(tag, &self.docker).args([
            "exec",
            "-w",
            WORKSPACE_MOUNT,
            name,
            "sh",
            "-c",
            script,
        ])
    }

    /// Force-remove the container, if any.
    pub fn remove(&self, name: &str) -> CommandSpec {
        CommandSpec::new("cleanup", &self.docker).args(["rm", "-f", name])
    }
}

impl Default for ContainerManager {
    fn default() -> Self {
        Self::new("docker")
    }
}
