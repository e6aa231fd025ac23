//! CLI: load a pipeline configuration and optionally run one request through it.
//!
//! Usage: `serve_pipeline --config <config.json> [--pipeline <name> --request <request.json>]`
//!
//! The request file maps input names to FP32 tensors:
//! `{"pipeline_input": {"shape": [1, 3], "data": [3.2, 5.7, -2.4]}}`.
//! The response is printed in the same layout.
//!
//! Set RUST_LOG=dag_serving=trace for span enter/exit events.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use clap::Parser;
use dag_serving::{Buffer, EngineConfig, NoModelBackend, PredictRequest, ServableManager};
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt::format::FmtSpan};

/// Load a pipeline configuration and run a request through it.
#[derive(Parser, Debug)]
#[command(name = "serve_pipeline")]
struct Args {
  /// Path to the JSON server configuration
  #[arg(long, value_name = "FILE")]
  config: PathBuf,

  /// Directory custom node library paths must resolve into
  #[arg(long, value_name = "DIR")]
  library_root: Option<PathBuf>,

  /// Pipeline to run the request through
  #[arg(long, value_name = "NAME", requires = "request")]
  pipeline: Option<String>,

  /// JSON file with FP32 request inputs
  #[arg(long, value_name = "FILE", requires = "pipeline")]
  request: Option<PathBuf>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Tensor {
  shape: Vec<u64>,
  data: Vec<f32>,
}

fn read_request(path: &Path) -> Result<PredictRequest, String> {
  let bytes = std::fs::read(path).map_err(|e| format!("{}: {e}", path.display()))?;
  let tensors: BTreeMap<String, Tensor> =
    serde_json::from_slice(&bytes).map_err(|e| format!("{}: {e}", path.display()))?;
  let mut request = PredictRequest::new();
  for (name, tensor) in tensors {
    let buffer = Buffer::from_f32(tensor.shape, &tensor.data).map_err(|e| format!("{name}: {e}"))?;
    request = request.with_input(name, buffer);
  }
  Ok(request)
}

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .with_span_events(FmtSpan::ENTER | FmtSpan::EXIT)
    .init();

  let args = Args::parse();
  info!(config = %args.config.display(), "serve_pipeline starting");

  let config = match EngineConfig::from_file(&args.config) {
    Ok(config) => config,
    Err(e) => {
      eprintln!("Error: {e}");
      process::exit(1);
    }
  };

  let manager = ServableManager::new(Arc::new(NoModelBackend), args.library_root);
  manager.start();
  for failure in manager.load_config(&config) {
    error!(%failure, "configuration entry not applied");
  }
  for (name, status) in manager.statuses() {
    println!("{name}: {:?}", status.state());
  }

  let mut exit_code = 0;
  if let (Some(pipeline), Some(path)) = (&args.pipeline, &args.request) {
    exit_code = match run(&manager, pipeline, path).await {
      Ok(json) => {
        println!("{json}");
        0
      }
      Err(message) => {
        eprintln!("Error: {message}");
        1
      }
    };
  }

  manager.shutdown().await;
  process::exit(exit_code);
}

async fn run(manager: &ServableManager, pipeline: &str, path: &Path) -> Result<String, String> {
  let request = read_request(path)?;
  let response = manager
    .execute(pipeline, &request)
    .await
    .map_err(|status| format!("pipeline {pipeline} failed: {status}"))?;
  let mut outputs = BTreeMap::new();
  for (name, buffer) in &response.outputs {
    let data = buffer
      .to_f32_vec()
      .ok_or_else(|| format!("output {name} is not FP32"))?;
    outputs.insert(
      name.clone(),
      Tensor {
        shape: buffer.shape().to_vec(),
        data,
      },
    );
  }
  serde_json::to_string_pretty(&outputs).map_err(|e| e.to_string())
}
