pub mod audio;
pub mod config;
pub mod ctc;
pub mod error;
pub mod feature;
pub mod inference;
pub mod logging;
pub mod model;
pub mod session;
pub mod transport;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::inference::{Recognizer, SenseVoiceEngine, StubRecognizer};
use crate::model::ProfileConfig;

const MODEL_RELATIVE_PATH: &str = "models/sensevoice-small.onnx";

/// Resolves the service's base directory: `GHOSTTYPE_BASE_PATH` if set,
/// else the directory containing the running executable.
pub fn resolve_base_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("GHOSTTYPE_BASE_PATH") {
        return PathBuf::from(dir);
    }

    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
}

fn load_recognizer(base_dir: &Path, config: &ProfileConfig) -> Arc<dyn Recognizer> {
    let model_path = base_dir.join(MODEL_RELATIVE_PATH);

    if !model_path.exists() {
        tracing::warn!(
            path = %model_path.display(),
            "ASR model not found; using stub | 未找到 ASR 模型，使用占位识别器"
        );
        return Arc::new(StubRecognizer);
    }

    tracing::info!(path = %model_path.display(), "Loading ASR model | 正在加载 ASR 模型");
    match SenseVoiceEngine::load(&model_path, config) {
        Ok(engine) => {
            let providers = engine.providers().map(|p| p.join(", ")).unwrap_or_default();
            tracing::info!(providers = %providers, "ASR model loaded | ASR 模型加载完成");
            Arc::new(engine)
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to load ASR model; using stub | 加载 ASR 模型失败，使用占位识别器");
            Arc::new(StubRecognizer)
        }
    }
}

/// Builds the shared application state (recognizer, loaded once at
/// startup) and the axum router ready to be served.
pub fn build_app(base_dir: &Path, config: &ProfileConfig) -> axum::Router {
    let recognizer = load_recognizer(base_dir, config);
    transport::router(transport::AppState { recognizer })
}
