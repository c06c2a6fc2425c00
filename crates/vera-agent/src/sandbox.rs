//! Sandbox backend: one disposable container per task.
//!
//! The supervisor only ever talks to the `SandboxBackend` trait; the shipped
//! implementation drives the `docker` CLI. The host work directory is
//! mounted read-write at `/work`, the optional input directory read-only at
//! `/input`, and every exec is wrapped in a hard `timeout`.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::path::Path;
use std::process::Stdio;
use tokio::io::AsyncRead;
use tokio::process::Command;

use crate::shell::shlex_quote;
use vera_core::config::{CONTAINER_NAME_PREFIX, IMAGE_NAME, MAX_TOOL_SECONDS, VENV_DIR};

const DOCKERFILE: &str = include_str!("../assets/docker/Dockerfile");

/// A running sandbox and its resource attributes, as recorded in the trace.
#[derive(Debug, Clone, Serialize)]
pub struct Sandbox {
    pub container_id: String,
    pub name: String,
    pub mem_limit: Option<String>,
    pub nano_cpus: Option<i64>,
    pub pids_limit: Option<i64>,
    pub privileged: bool,
    pub network_mode: String,
}

#[derive(Debug)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub output: String,
}

pub type ByteStream = Box<dyn AsyncRead + Send + Unpin>;

#[async_trait]
pub trait SandboxBackend: Send + Sync {
    async fn start(
        &self,
        input_dir: Option<&Path>,
        work_dir: &Path,
        network_enabled: bool,
    ) -> Result<Sandbox>;

    /// Run argv inside the sandbox with a hard timeout; returns the exit
    /// code and combined stdout/stderr.
    async fn exec(&self, sandbox: &Sandbox, argv: &[String], timeout_s: u64) -> Result<ExecOutput>;

    /// Merged stdout/stderr of the container, following.
    async fn logs_stream(&self, sandbox: &Sandbox) -> Result<ByteStream>;

    /// Backend events for this container, one JSON object per line.
    async fn events_stream(&self, sandbox: &Sandbox) -> Result<ByteStream>;

    async fn stop(&self, sandbox: &Sandbox) -> Result<()>;
}

/// `SandboxBackend` over the `docker` CLI.
pub struct DockerBackend;

impl DockerBackend {
    pub fn new() -> Self {
        Self
    }

    async fn docker(&self, args: &[&str]) -> Result<std::process::Output> {
        Command::new("docker")
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .with_context(|| format!("Failed to run docker {}", args.first().unwrap_or(&"")))
    }

    pub async fn build_image(&self) -> Result<()> {
        let ctx_dir = std::env::temp_dir().join(format!("vera-build-{}", std::process::id()));
        tokio::fs::create_dir_all(&ctx_dir).await?;
        tokio::fs::write(ctx_dir.join("Dockerfile"), DOCKERFILE).await?;

        let status = Command::new("docker")
            .args(["build", "-t", IMAGE_NAME])
            .arg(&ctx_dir)
            .status()
            .await
            .context("Failed to run docker build")?;
        let _ = tokio::fs::remove_dir_all(&ctx_dir).await;
        if !status.success() {
            bail!("docker build failed for {IMAGE_NAME}");
        }
        Ok(())
    }

    pub async fn ensure_image(&self) -> Result<()> {
        let out = self.docker(&["image", "inspect", IMAGE_NAME]).await?;
        if out.status.success() {
            return Ok(());
        }
        self.build_image().await
    }

    async fn ensure_venv(&self, sandbox: &Sandbox) -> Result<()> {
        let cmd = format!(
            "test -x {} || python3 -m venv {}",
            shlex_quote(&format!("{VENV_DIR}/bin/python")),
            shlex_quote(VENV_DIR),
        );
        let argv = vec!["bash".to_string(), "-lc".to_string(), cmd];
        let out = self.exec(sandbox, &argv, MAX_TOOL_SECONDS).await?;
        if out.exit_code != 0 {
            bail!("Failed to initialize /work virtualenv: {}", out.output);
        }
        Ok(())
    }
}

impl Default for DockerBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SandboxBackend for DockerBackend {
    async fn start(
        &self,
        input_dir: Option<&Path>,
        work_dir: &Path,
        network_enabled: bool,
    ) -> Result<Sandbox> {
        self.ensure_image().await?;

        tokio::fs::create_dir_all(work_dir)
            .await
            .with_context(|| format!("Failed to create work dir {}", work_dir.display()))?;
        if let Some(input) = input_dir {
            if !input.is_dir() {
                bail!("input_dir not found: {}", input.display());
            }
        }

        let epoch = chrono::Utc::now().timestamp();
        let name = format!("{CONTAINER_NAME_PREFIX}{}-{}", epoch, std::process::id());
        let network_mode = if network_enabled { "bridge" } else { "none" };
        let work_abs = std::fs::canonicalize(work_dir)
            .with_context(|| format!("Failed to resolve work dir {}", work_dir.display()))?;

        // Lab-mode: full privilege for maximal autonomy. This disables most
        // isolation guardrails; only run against trusted local setups.
        let mut args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "--name".into(),
            name.clone(),
            "--network".into(),
            network_mode.into(),
            "--privileged".into(),
            "-v".into(),
            format!("{}:/work:rw", work_abs.display()),
        ];
        if let Some(input) = input_dir {
            let input_abs = std::fs::canonicalize(input)?;
            args.push("-v".into());
            args.push(format!("{}:/input:ro", input_abs.display()));
        }
        args.push(IMAGE_NAME.into());
        args.extend(["bash".into(), "-lc".into(), "sleep infinity".into()]);

        let arg_refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
        let out = self.docker(&arg_refs).await?;
        if !out.status.success() {
            bail!(
                "docker run failed: {}",
                String::from_utf8_lossy(&out.stderr)
            );
        }
        let container_id = String::from_utf8_lossy(&out.stdout).trim().to_string();
        if container_id.is_empty() {
            bail!("docker run returned no container id");
        }

        let sandbox = Sandbox {
            container_id,
            name,
            mem_limit: None,
            nano_cpus: None,
            pids_limit: None,
            privileged: true,
            network_mode: network_mode.to_string(),
        };
        self.ensure_venv(&sandbox).await?;
        Ok(sandbox)
    }

    async fn exec(&self, sandbox: &Sandbox, argv: &[String], timeout_s: u64) -> Result<ExecOutput> {
        let quoted: Vec<String> = argv.iter().map(|a| shlex_quote(a)).collect();
        let wrapped = format!("timeout {timeout_s}s {}", quoted.join(" "));
        let out = self
            .docker(&["exec", &sandbox.container_id, "bash", "-lc", &wrapped])
            .await?;
        let mut output = String::from_utf8_lossy(&out.stdout).to_string();
        output.push_str(&String::from_utf8_lossy(&out.stderr));
        Ok(ExecOutput {
            exit_code: out.status.code().unwrap_or(-1),
            output,
        })
    }

    async fn logs_stream(&self, sandbox: &Sandbox) -> Result<ByteStream> {
        // Merge the container's stdout/stderr into one descriptor.
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(format!(
                "exec docker logs -f {} 2>&1",
                shlex_quote(&sandbox.container_id)
            ))
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .context("Failed to spawn docker logs")?;
        let stdout = child
            .stdout
            .take()
            .context("docker logs produced no stdout")?;
        tokio::spawn(async move {
            let _ = child.wait().await;
        });
        Ok(Box::new(stdout))
    }

    async fn events_stream(&self, sandbox: &Sandbox) -> Result<ByteStream> {
        let mut child = Command::new("docker")
            .args([
                "events",
                "--filter",
                &format!("container={}", sandbox.container_id),
                "--format",
                "{{json .}}",
            ])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .context("Failed to spawn docker events")?;
        let stdout = child
            .stdout
            .take()
            .context("docker events produced no stdout")?;
        tokio::spawn(async move {
            let _ = child.wait().await;
        });
        Ok(Box::new(stdout))
    }

    async fn stop(&self, sandbox: &Sandbox) -> Result<()> {
        let _ = self.docker(&["rm", "-f", &sandbox.container_id]).await;
        Ok(())
    }
}
