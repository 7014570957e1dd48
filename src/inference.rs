//! Inference Engine: owns the ONNX Runtime session, selects an
//! execution-provider fallback chain, and marshals inputs for either
//! model variant described by [`ModelProfile`].

use std::path::Path;
use std::sync::Mutex;

use ndarray::{Array1, Array3};
use ort::execution_providers::{
    CPUExecutionProvider, CUDAExecutionProvider, CoreMLExecutionProvider,
    DirectMLExecutionProvider, ExecutionProvider,
};
use ort::session::Session;
use ort::value::{Tensor, TensorRef};

use crate::ctc;
use crate::feature;
use crate::model::{ModelMode, ModelProfile, ProfileConfig, ProfileError};

#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("model load failed: {0}")]
    ModelLoad(String),

    #[error("{0}")]
    Profile(#[from] ProfileError),

    #[error("asr failed: {0}")]
    Failed(String),
}

pub type Result<T> = std::result::Result<T, InferenceError>;

/// Contract the Session Core depends on; the real engine and the stub
/// both satisfy it, so the pipeline never needs to know which is live.
pub trait Recognizer: Send + Sync {
    fn transcribe(&self, pcm_s16le: &[i16], sample_rate: u32) -> Result<String>;

    /// Resolved execution providers, for startup logging. `None` for
    /// recognizers (the stub) with no backend concept.
    fn providers(&self) -> Option<&[String]> {
        None
    }
}

/// Used when no model file is present, or the model failed to load.
/// Returns a fixed diagnostic string describing the PCM it was given so
/// the full protocol surface stays testable without a model.
pub struct StubRecognizer;

impl Recognizer for StubRecognizer {
    fn transcribe(&self, pcm_s16le: &[i16], sample_rate: u32) -> Result<String> {
        Ok(format!(
            "[pcm_bytes={} sr={}]",
            pcm_s16le.len() * 2,
            sample_rate
        ))
    }
}

const PREFERRED_PROVIDERS: [&str; 4] = [
    "CUDAExecutionProvider",
    "CoreMLExecutionProvider",
    "DmlExecutionProvider",
    "CPUExecutionProvider",
];

pub struct SenseVoiceEngine {
    session: Mutex<Session>,
    profile: ModelProfile,
}

impl SenseVoiceEngine {
    pub fn load(model_path: &Path, config: &ProfileConfig) -> Result<Self> {
        if !model_path.exists() {
            return Err(InferenceError::ModelLoad(format!(
                "model file not found: {}",
                model_path.display()
            )));
        }

        let cpu_session = Session::builder()
            .map_err(|e| InferenceError::ModelLoad(e.to_string()))?
            .with_intra_threads(1)
            .map_err(|e| InferenceError::ModelLoad(e.to_string()))?
            .with_execution_providers([CPUExecutionProvider::default().build()])
            .map_err(|e| InferenceError::ModelLoad(e.to_string()))?
            .commit_from_file(model_path)
            .map_err(|e| InferenceError::ModelLoad(e.to_string()))?;

        let is_ort_quant = {
            let meta = cpu_session.metadata().ok();
            meta.and_then(|m| m.custom("onnx.infer").ok().flatten())
                .map(|v| v.trim() == "onnxruntime.quant")
                .unwrap_or(false)
        };

        let wants = resolve_wanted_providers(is_ort_quant);
        let (session, providers) =
            Self::create_session_with_providers(model_path, &wants, cpu_session)?;

        let profile = ModelProfile::from_session(&session, model_path, config, providers)?;

        Ok(Self {
            session: Mutex::new(session),
            profile,
        })
    }

    fn create_session_with_providers(
        model_path: &Path,
        wants: &[&str],
        cpu_session: Session,
    ) -> Result<(Session, Vec<String>)> {
        if wants == ["CPUExecutionProvider"] {
            return Ok((cpu_session, vec!["CPUExecutionProvider".to_string()]));
        }

        if !wants.contains(&"DmlExecutionProvider") {
            let session = build_session(model_path, wants, None)
                .map_err(|e| InferenceError::ModelLoad(e.to_string()))?;
            return Ok((session, wants.iter().map(|s| s.to_string()).collect()));
        }

        let device_ids = candidate_dml_device_ids();
        for device_id in device_ids {
            match build_session(model_path, wants, Some(device_id)) {
                Ok(session) => return Ok((session, wants.iter().map(|s| s.to_string()).collect())),
                Err(_) => continue,
            }
        }

        tracing::warn!(
            model = %model_path.display(),
            "DirectML 初始化失败，回退 CPU | DML init failed, falling back to CPU"
        );
        Ok((cpu_session, vec!["CPUExecutionProvider".to_string()]))
    }

    fn transcribe_ctc(&self, pcm_s16le: &[i16], sample_rate: u32) -> Result<String> {
        if sample_rate != self.profile.expected_sample_rate {
            return Ok(format!(
                "[unsupported sample_rate={sample_rate}; expected {}]",
                self.profile.expected_sample_rate
            ));
        }

        tracing::debug!("ASR inference started | ASR 推理开始");
        let features = feature::sensevoice_ctc_features(
            pcm_s16le,
            sample_rate,
            self.profile.n_mels,
            self.profile.lfr_window,
            self.profile.lfr_shift,
            &self.profile.cmvn_neg_mean,
            &self.profile.cmvn_inv_stddev,
        )
        .map_err(|e| InferenceError::Failed(e.to_string()))?;

        if features.num_frames() == 0 {
            return Ok(String::new());
        }

        let t = features.num_frames();
        let dim = features.feature_dim;
        let mut x = Array3::<f32>::zeros((1, t, dim));
        for (i, row) in features.rows.iter().enumerate() {
            for (j, &v) in row.iter().enumerate() {
                x[[0, i, j]] = v;
            }
        }

        let x_tensor = TensorRef::from_array_view(x.view())
            .map_err(|e| InferenceError::Failed(e.to_string()))?;
        let x_length = Tensor::<i32>::from_array(([1usize], vec![t as i32].into_boxed_slice()))
            .map_err(|e| InferenceError::Failed(e.to_string()))?;
        let language = Tensor::<i32>::from_array((
            [1usize],
            vec![self.profile.language_id].into_boxed_slice(),
        ))
        .map_err(|e| InferenceError::Failed(e.to_string()))?;
        let text_norm = Tensor::<i32>::from_array((
            [1usize],
            vec![self.profile.text_norm_id].into_boxed_slice(),
        ))
        .map_err(|e| InferenceError::Failed(e.to_string()))?;

        let mut session = self.session.lock().expect("inference session mutex poisoned");
        let outputs = session
            .run(ort::inputs! {
                "x" => x_tensor,
                "x_length" => x_length,
                "language" => language,
                "text_norm" => text_norm,
            })
            .map_err(|e| InferenceError::Failed(e.to_string()))?;

        let text = ctc::decode_outputs(&outputs, &self.profile)
            .map_err(|e| InferenceError::Failed(e.to_string()))?;
        tracing::debug!("ASR inference completed | ASR 推理完成");
        Ok(text)
    }

    fn transcribe_waveform(&self, pcm_s16le: &[i16], sample_rate: u32) -> Result<String> {
        if sample_rate != self.profile.expected_sample_rate {
            return Ok(format!(
                "[unsupported sample_rate={sample_rate}; expected {}]",
                self.profile.expected_sample_rate
            ));
        }

        let waveform: Array1<f32> = pcm_s16le.iter().map(|&s| s as f32 / 32768.0).collect();
        let n = waveform.len();

        let length_input = self.profile.length_input.clone();

        let shapes: [Vec<usize>; 3] = [vec![1, n], vec![n], vec![1, 1, n]];
        let mut last_err = String::new();
        for shape in shapes {
            let reshaped = waveform
                .clone()
                .into_shape_with_order(shape.clone())
                .map_err(|e| InferenceError::Failed(e.to_string()))?;
            let wave_tensor = match TensorRef::from_array_view(reshaped.view()) {
                Ok(t) => t,
                Err(e) => {
                    last_err = e.to_string();
                    continue;
                }
            };

            let mut session = self.session.lock().expect("inference session mutex poisoned");
            let mut inputs = ort::inputs! { self.profile.waveform_input_name.clone() => wave_tensor };
            if let Some((name, is_int64)) = &length_input {
                if *is_int64 {
                    if let Ok(t) = Tensor::<i64>::from_array(([1usize], vec![n as i64].into_boxed_slice())) {
                        inputs.push((name.clone().into(), t.into()));
                    }
                } else if let Ok(t) = Tensor::<i32>::from_array(([1usize], vec![n as i32].into_boxed_slice())) {
                    inputs.push((name.clone().into(), t.into()));
                }
            }

            match session.run(inputs) {
                Ok(outputs) => {
                    return ctc::decode_outputs(&outputs, &self.profile)
                        .map_err(|e| InferenceError::Failed(e.to_string()))
                }
                Err(e) => last_err = e.to_string(),
            }
        }

        Err(InferenceError::Failed(format!("onnx inference failed: {last_err}")))
    }
}

impl Recognizer for SenseVoiceEngine {
    fn transcribe(&self, pcm_s16le: &[i16], sample_rate: u32) -> Result<String> {
        match self.profile.mode {
            ModelMode::CtcWithFeatures => self.transcribe_ctc(pcm_s16le, sample_rate),
            ModelMode::WaveformDirect => self.transcribe_waveform(pcm_s16le, sample_rate),
        }
    }

    fn providers(&self) -> Option<&[String]> {
        Some(&self.profile.providers)
    }
}

fn resolve_wanted_providers(is_ort_quant: bool) -> Vec<&'static str> {
    let available: Vec<&'static str> = PREFERRED_PROVIDERS
        .into_iter()
        .filter(|name| provider_is_available(name))
        .collect();

    let wants: Vec<&'static str> = if available.is_empty() {
        vec!["CPUExecutionProvider"]
    } else {
        available
    };

    let wants: Vec<&'static str> = wants
        .into_iter()
        .filter(|&p| !(p == "DmlExecutionProvider" && is_ort_quant))
        .collect();

    if wants.is_empty() {
        vec!["CPUExecutionProvider"]
    } else {
        wants
    }
}

fn provider_is_available(name: &str) -> bool {
    match name {
        "CUDAExecutionProvider" => CUDAExecutionProvider::default().is_available().unwrap_or(false),
        "CoreMLExecutionProvider" => CoreMLExecutionProvider::default().is_available().unwrap_or(false),
        "DmlExecutionProvider" => DirectMLExecutionProvider::default().is_available().unwrap_or(false),
        "CPUExecutionProvider" => true,
        _ => false,
    }
}

fn candidate_dml_device_ids() -> Vec<i32> {
    if let Ok(raw) = std::env::var("GHOSTTYPE_DML_DEVICE_ID").or_else(|_| std::env::var("ORT_DML_DEVICE_ID")) {
        return vec![raw.parse().unwrap_or(0)];
    }
    // Heuristic for laptops: 0 often = iGPU, 1 often = dGPU.
    vec![1, 0]
}

fn build_session(model_path: &Path, wants: &[&str], dml_device_id: Option<i32>) -> ort::Result<Session> {
    let mut providers = Vec::new();
    for &name in wants {
        let dispatch = match name {
            "CUDAExecutionProvider" => CUDAExecutionProvider::default().build(),
            "CoreMLExecutionProvider" => CoreMLExecutionProvider::default().build(),
            "DmlExecutionProvider" => {
                let mut ep = DirectMLExecutionProvider::default();
                if let Some(id) = dml_device_id {
                    ep = ep.with_device_id(id);
                }
                ep.build()
            }
            _ => CPUExecutionProvider::default().build(),
        };
        providers.push(dispatch);
    }

    Session::builder()?
        .with_intra_threads(1)?
        .with_execution_providers(providers)?
        .commit_from_file(model_path)
}
