//! Subcommand handlers.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clausegate_core::config::{
    load_config, load_config_file, user_config_path, workspace_config_path,
};
use clausegate_core::governor::ResourceStatus;
use clausegate_core::{
    AnalysisRequest, DocumentAnalyzer, FallbackAnalyzer, GovernorConfig, ResourceManager,
    SimulatedModel,
};
use futures::future::join_all;
use tracing::info;

use crate::{Commands, ConfigAction, SimulateArgs};

const SAMPLE_CONTRACT: &str = "This Agreement shall commence on the Effective Date and continue \
for twelve months. Either party may terminate upon thirty days written notice. The Supplier \
shall indemnify the Customer against all third-party claims arising from the Services.";

pub async fn handle_command(
    command: Commands,
    workspace: &Path,
    config_path: Option<&Path>,
) -> anyhow::Result<()> {
    match command {
        Commands::Simulate(args) => {
            let config = load(workspace, config_path)?;
            let report = run_simulation(&args, config).await?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&report.status)?);
            } else {
                print!("{}", report.render());
            }
            Ok(())
        }
        Commands::Status => {
            let manager = ResourceManager::new(load(workspace, config_path)?)?;
            println!("{}", serde_json::to_string_pretty(&manager.get_status())?);
            Ok(())
        }
        Commands::Config { action } => handle_config(action, workspace, config_path),
    }
}

fn load(workspace: &Path, config_path: Option<&Path>) -> anyhow::Result<GovernorConfig> {
    match config_path {
        Some(path) => Ok(load_config_file(path)?),
        None => load_config(Some(workspace), None)
            .map_err(|e| anyhow::anyhow!("Configuration error: {}", e)),
    }
}

fn handle_config(
    action: ConfigAction,
    workspace: &Path,
    config_path: Option<&Path>,
) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let path = workspace_config_path(workspace);
            if path.exists() {
                println!("Configuration file already exists at: {}", path.display());
                return Ok(());
            }
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir)?;
            }
            let toml_str = toml::to_string_pretty(&GovernorConfig::default())?;
            std::fs::write(&path, toml_str)?;
            println!("Created default configuration at: {}", path.display());
            Ok(())
        }
        ConfigAction::Show => {
            let config = load(workspace, config_path)?;
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        ConfigAction::Validate => {
            let problems = load(workspace, config_path)?.validate();
            if problems.is_empty() {
                println!("Configuration is valid");
                return Ok(());
            }
            for problem in &problems {
                println!("  - {problem}");
            }
            anyhow::bail!("configuration has {} problem(s)", problems.len())
        }
        ConfigAction::Path => {
            let describe = |path: &Path| {
                let marker = if path.exists() { "found" } else { "missing" };
                format!("{} ({marker})", path.display())
            };
            match user_config_path() {
                Some(path) => println!("user:      {}", describe(&path)),
                None => println!("user:      (no config directory on this platform)"),
            }
            println!("workspace: {}", describe(&workspace_config_path(workspace)));
            if let Some(path) = config_path {
                println!("explicit:  {}", describe(path));
            }
            Ok(())
        }
    }
}

pub(crate) struct SimulationReport {
    pub succeeded: usize,
    pub failed: usize,
    pub by_backend: BTreeMap<String, usize>,
    pub local_optimizations: usize,
    pub summary: String,
    pub status: ResourceStatus,
}

impl SimulationReport {
    fn render(&self) -> String {
        let backends = self
            .by_backend
            .iter()
            .map(|(name, count)| format!("{name}={count}"))
            .collect::<Vec<_>>()
            .join(", ");
        let status = &self.status;
        format!(
            "Processed {} documents: {} succeeded, {} failed\n\
             Backends: {}\n\
             Memory: {:.1} MB of {:.1} MB ({:.1}%), {} optimization call(s) on local model\n\
             Degraded: {} (ceiling {} of {})\n\
             Performance: {}\n",
            self.succeeded + self.failed,
            self.succeeded,
            self.failed,
            if backends.is_empty() { "none" } else { backends.as_str() },
            status.memory_usage_mb,
            status.limits.memory_limit_mb,
            status.memory_utilization * 100.0,
            self.local_optimizations,
            status.is_degraded,
            status.queue.max_concurrent,
            status.limits.max_concurrent,
            self.summary,
        )
    }
}

pub(crate) async fn run_simulation(
    args: &SimulateArgs,
    mut config: GovernorConfig,
) -> anyhow::Result<SimulationReport> {
    if let Some(max) = args.max_concurrent {
        config.resources.max_concurrent = max;
    }
    if let Some(mb) = args.memory_limit_mb {
        config.resources.memory_limit_mb = mb;
    }

    let manager = ResourceManager::new(config)?;
    let latency = Duration::from_millis(args.latency_ms);
    let local = Arc::new(
        SimulatedModel::new("local", args.memory_mb)
            .with_latency(latency)
            .with_growth_per_request(args.growth_mb)
            .with_release_fraction(args.release_fraction),
    );
    local.set_failing(args.local_failing);
    let api = Arc::new(SimulatedModel::new("api", 0.0).with_latency(latency * 2));
    manager.register_model_manager(local.clone());

    let backend = Arc::new(FallbackAnalyzer::new(
        vec![local.clone(), api],
        3,
        Duration::from_secs(30),
    ));
    let analyzer = DocumentAnalyzer::new(manager.clone(), backend);

    info!(requests = args.requests, "Starting simulation");
    manager.start();
    let results = join_all((0..args.requests).map(|i| {
        let analyzer = analyzer.clone();
        async move {
            analyzer
                .analyze(AnalysisRequest::new(
                    format!("contract-{i:04}"),
                    SAMPLE_CONTRACT,
                ))
                .await
        }
    }))
    .await;
    manager.stop();

    let mut by_backend = BTreeMap::new();
    let mut failed = 0;
    for result in results {
        match result {
            Ok(analysis) => *by_backend.entry(analysis.backend).or_insert(0) += 1,
            Err(_) => failed += 1,
        }
    }

    Ok(SimulationReport {
        succeeded: by_backend.values().sum(),
        failed,
        by_backend,
        local_optimizations: local.optimize_calls(),
        summary: manager.monitor().get_summary().to_string(),
        status: manager.get_status(),
    })
}
