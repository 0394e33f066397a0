// This file is an example of how to use the `quickdetect` library.
// The main library entry point is `src/lib.rs`.
//
// It classifies still images by their mean luminance through the full
// submit -> run -> sink path and prints one JSON line per result on stdout.
// Logs go to stderr and honour RUST_LOG.

use anyhow::{Context, Result, bail};
use quickdetect::core_modules::preset::InferenceParams;
use quickdetect::core_modules::result::{Classification, ResultSink, ResultUnit, RunReport, TaskOutput};
use quickdetect::pipeline::{Frame, MediaReference, Preset, RunState, TaskKind};
use quickdetect::{
    MediaError, Model, ModelError, ModelProvider, ModelRequest, ModelUnavailable, OrchestratorConfig, PipelineOrchestrator,
    RunId, RunRequest,
};
use std::env;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const CLASSES: [(&str, f32); 3] = [("dark", 0.0), ("medium", 0.5), ("bright", 1.0)];

/// Scores each brightness class by its distance from the image's mean luminance.
struct LuminanceModel;

impl Model for LuminanceModel {
    fn task(&self) -> TaskKind {
        TaskKind::Classify
    }

    fn infer(&mut self, unit: &Frame, _params: &InferenceParams) -> Result<TaskOutput, ModelError> {
        if unit.pixel_count() == 0 {
            return Err(ModelError::InvalidInput("frame has no pixels".to_string()));
        }

        let total: f64 = unit
            .data
            .chunks_exact(4)
            .map(|px| 0.2126 * px[0] as f64 + 0.7152 * px[1] as f64 + 0.0722 * px[2] as f64)
            .sum();
        let luma = (total / unit.pixel_count() as f64 / 255.0) as f32;

        let mut scores: Vec<Classification> = CLASSES
            .iter()
            .enumerate()
            .map(|(class_id, (label, center))| Classification {
                class_id: class_id as u32,
                label: label.to_string(),
                confidence: (1.0 - (luma - center).abs() * 2.0).max(0.0),
            })
            .collect();
        scores.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        Ok(TaskOutput::Classify(scores))
    }
}

struct LuminanceProvider;

impl ModelProvider for LuminanceProvider {
    fn get_model(&self, request: &ModelRequest) -> Result<Box<dyn Model>, ModelUnavailable> {
        if request.task != TaskKind::Classify {
            return Err(ModelUnavailable {
                task: request.task,
                weight_id: request.weight_id.clone(),
                reason: "only classification is available".to_string(),
            });
        }
        Ok(Box::new(LuminanceModel))
    }
}

/// Prints each result as a JSON line.
struct JsonLines;

impl ResultSink for JsonLines {
    fn on_result(&self, unit: &Arc<ResultUnit>) {
        match serde_json::to_string(unit.as_ref()) {
            Ok(line) => println!("{line}"),
            Err(e) => warn!(error = %e, "could not serialize result"),
        }
    }

    fn on_media_error(&self, run_id: RunId, error: &MediaError) {
        warn!(run = %run_id, %error, "skipped unreadable image");
    }

    fn on_finished(&self, report: &RunReport) {
        info!(run = %report.run_id, state = ?report.state, units = report.units_processed, skipped = report.skipped.len(), "run finished");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // --- 1. Logging & Argument Parsing ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let mut args = env::args().skip(1).peekable();
    let mut preset = Preset::new("luminance", "builtin-luminance");
    if args.peek().map(String::as_str) == Some("--preset") {
        args.next();
        let path = args.next().context("--preset needs a file path")?;
        let raw = std::fs::read_to_string(&path).with_context(|| format!("reading preset {path}"))?;
        let (loaded, repaired) = Preset::from_json(&raw).with_context(|| format!("parsing preset {path}"))?;
        if repaired {
            warn!(%path, "preset contained invalid values and was repaired");
        }
        preset = loaded;
    }
    let media: Vec<MediaReference> = args.map(|raw| MediaReference::resolve(&raw)).collect();
    if media.is_empty() {
        println!("Usage: quickdetect [--preset <preset.json>] <image>...");
        return Ok(());
    }

    // --- 2. Orchestrator Setup ---
    let config = OrchestratorConfig::from_env().context("reading QD_* configuration")?;
    let orchestrator = PipelineOrchestrator::builder(Arc::new(LuminanceProvider))
        .sink(Arc::new(JsonLines))
        .config(config)
        .build()?;

    // --- 3. Run ---
    let handle = orchestrator.submit(RunRequest::new(media, TaskKind::Classify, preset))?;
    let report = tokio::select! {
        report = handle.wait() => report,
        _ = tokio::signal::ctrl_c() => {
            orchestrator.cancel(&handle);
            handle.wait().await
        }
    };
    orchestrator.shutdown().await;

    match (&report.state, &report.error) {
        (RunState::Failed, Some(e)) => bail!("run failed after {} unit(s): {e}", report.units_processed),
        (state, _) => info!(?state, units = report.units_processed, "done"),
    }
    Ok(())
}
