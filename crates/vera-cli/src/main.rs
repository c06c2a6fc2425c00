use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};

use vera_agent::{run_task, ChatClient, DockerBackend, RunOptions};
use vera_core::Config;

/// Verified tool-using agent supervisor
#[derive(Parser)]
#[command(name = "vera", version, about = "Sandboxed research agent with adversarial verification")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the sandbox docker image
    Build,
    /// Run one agent task in a fresh sandbox
    Run {
        /// The task to solve
        #[arg(long)]
        task: String,
        /// Host directory mounted read-write at /work
        #[arg(long)]
        work_dir: PathBuf,
        /// Optional host directory mounted read-only at /input
        #[arg(long)]
        input_dir: Option<PathBuf>,
        /// OpenAI-compatible endpoint, with or without /v1
        #[arg(long, env = "MODEL_BASE_URL", default_value = "http://127.0.0.1:1234")]
        model_base_url: String,
        /// Model name (optional for single-model servers)
        #[arg(long, env = "MODEL_NAME", default_value = "")]
        model_name: String,
        /// Exported into the sandbox session for search scripts
        #[arg(long, env = "BRAVE_API_KEY")]
        brave_api_key: Option<String>,
        #[arg(long, default_value_t = 0.2)]
        temperature: f64,
        /// Max agent steps (0 for unlimited)
        #[arg(long, default_value_t = 120)]
        max_steps: usize,
        /// System prompt profile, e.g. "en"
        #[arg(long, env = "PROMPT_PROFILE", default_value = "")]
        prompt_profile: String,
        /// Role the system prompt is sent as: "system" or "user"
        #[arg(long, env = "SYSTEM_ROLE", default_value = "system")]
        system_role: String,
    },
    /// Serve the local dashboard over a base directory of sessions
    Dashboard {
        /// Base dir for resolving relative work-dir paths
        #[arg(long, default_value = ".")]
        base_dir: PathBuf,
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(long, default_value_t = 8844)]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vera=info".into()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Build => DockerBackend::new().build_image().await,
        Commands::Dashboard { base_dir, host, port } => {
            vera_dashboard::serve(base_dir, &host, port).await
        }
        Commands::Run {
            task,
            work_dir,
            input_dir,
            model_base_url,
            model_name,
            brave_api_key,
            temperature,
            max_steps,
            prompt_profile,
            system_role,
        } => {
            let mut cfg = Config::from_env();
            cfg.model_base_url = model_base_url;
            cfg.model_name = model_name;
            cfg.max_steps = max_steps;
            cfg.prompt_profile =
                if prompt_profile.is_empty() { cfg.prompt_profile } else { Some(prompt_profile) };
            cfg.system_role = system_role;

            let client = ChatClient::new(
                &cfg.model_base_url,
                Some(cfg.model_name.as_str()).filter(|m| !m.is_empty()),
                cfg.model_timeout_s,
            )?;
            let backend = Arc::new(DockerBackend::new());
            let opts = RunOptions {
                task,
                input_dir,
                work_dir,
                brave_api_key,
                temperature,
            };

            let answer = run_task(&cfg, backend, &client, &opts).await?;
            let bar = "=".repeat(80);
            println!("\n{bar}\nFINAL ANSWER\n{bar}\n");
            println!("{answer}");
            Ok(())
        }
    }
}
