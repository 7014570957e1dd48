//! Model I/O Introspector: reads an ONNX model's custom metadata map
//! once at load time and builds the immutable [`ModelProfile`] that the
//! rest of the pipeline is shaped around.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use ort::session::Session;

#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    #[error("model profile invalid: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ProfileError>;

/// The two input-signature variants this service knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelMode {
    CtcWithFeatures,
    WaveformDirect,
}

const CTC_INPUTS: [&str; 4] = ["x", "x_length", "language", "text_norm"];
const DEFAULT_LFR_M: usize = 7;
const DEFAULT_LFR_N: usize = 6;
const CTC_DROP_LEADING_FRAMES: usize = 4;
const SPECIAL_TOKENS: [&str; 6] = ["<blank>", "<pad>", "<s>", "</s>", "<eos>", "<bos>"];

/// Process-wide, immutable result of introspecting the ONNX model.
#[derive(Debug, Clone)]
pub struct ModelProfile {
    pub mode: ModelMode,
    pub expected_sample_rate: u32,

    // CtcWithFeatures fields.
    pub feature_dim: usize,
    pub n_mels: usize,
    pub lfr_window: usize,
    pub lfr_shift: usize,
    pub cmvn_neg_mean: Vec<f32>,
    pub cmvn_inv_stddev: Vec<f32>,
    pub language_id: i32,
    pub text_norm_id: i32,
    pub input_x_is_f16: bool,

    // WaveformDirect fields.
    pub waveform_input_name: String,
    pub waveform_input_is_f16: bool,
    pub length_input: Option<(String, bool /* is_int64 */)>,

    pub vocabulary: Option<Vec<String>>,
    pub ctc_blank_id: i64,
    pub drop_leading_frames: usize,
    pub special_tokens: Vec<String>,

    pub providers: Vec<String>,
}

/// Caller-provided knobs that shape introspection when the model
/// metadata alone is ambiguous (mirrors `SenseVoiceConfig` upstream).
#[derive(Debug, Clone)]
pub struct ProfileConfig {
    pub sample_rate: u32,
    pub language: String,
    pub text_norm: String,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            language: "auto".to_string(),
            text_norm: "with_itn".to_string(),
        }
    }
}

struct InputDescriptor {
    name: String,
    is_float: bool,
    is_float16: bool,
    is_int64: bool,
    /// Static last-axis extent, if the model declares one (`-1`/absent
    /// axes are treated as unknown).
    last_dim: Option<usize>,
}

fn describe_inputs(session: &Session) -> Vec<InputDescriptor> {
    use ort::value::ValueType;

    session
        .inputs
        .iter()
        .map(|input| match &input.input_type {
            ValueType::Tensor { ty, shape, .. } => {
                let type_str = format!("{ty:?}");
                let last_dim = shape
                    .last()
                    .copied()
                    .filter(|&d| d > 0)
                    .map(|d| d as usize);
                InputDescriptor {
                    name: input.name.clone(),
                    is_float: type_str.contains("Float"),
                    is_float16: type_str.contains("Float16"),
                    is_int64: type_str.contains("Int64"),
                    last_dim,
                }
            }
            // Non-tensor inputs (sequence/map/optional) never occur on
            // the models this service targets.
            _ => InputDescriptor {
                name: input.name.clone(),
                is_float: false,
                is_float16: false,
                is_int64: false,
                last_dim: None,
            },
        })
        .collect()
}

fn read_custom_metadata(session: &Session) -> HashMap<String, String> {
    let mut map = HashMap::new();
    let Ok(meta) = session.metadata() else {
        return map;
    };
    let Ok(keys) = meta.custom_keys() else {
        return map;
    };
    for key in keys {
        if let Ok(Some(value)) = meta.custom(&key) {
            map.insert(key, value);
        }
    }
    map
}

impl ModelProfile {
    /// Builds a profile from an already-open CPU introspection session
    /// (per §4.5, the CPU session used purely to read metadata) plus
    /// the resolved execution providers for the real inference session.
    pub fn from_session(
        session: &Session,
        model_path: &Path,
        config: &ProfileConfig,
        providers: Vec<String>,
    ) -> Result<Self> {
        let meta = read_custom_metadata(session);
        let inputs = describe_inputs(session);
        let input_names: Vec<&str> = inputs.iter().map(|i| i.name.as_str()).collect();

        let vocabulary = load_vocabulary(&meta, model_path);

        if CTC_INPUTS.iter().all(|n| input_names.contains(n)) {
            Self::build_ctc(&meta, &inputs, config, vocabulary, providers)
        } else {
            Self::build_waveform(&inputs, vocabulary, providers)
        }
    }

    fn build_ctc(
        meta: &HashMap<String, String>,
        inputs: &[InputDescriptor],
        config: &ProfileConfig,
        vocabulary: Option<Vec<String>>,
        providers: Vec<String>,
    ) -> Result<Self> {
        let x_input = inputs
            .iter()
            .find(|i| i.name == "x")
            .ok_or_else(|| ProfileError::Invalid("sense_voice_ctc model missing input: x".into()))?;

        let feature_dim = x_input
            .last_dim
            .ok_or_else(|| ProfileError::Invalid(format!("unsupported x shape for input {:?}", x_input.name)))?;

        let lfr_m: usize = meta
            .get("lfr_window_size")
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_LFR_M);
        let lfr_n: usize = meta
            .get("lfr_window_shift")
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_LFR_N);

        if feature_dim % lfr_m != 0 {
            return Err(ProfileError::Invalid(format!(
                "feature_dim {feature_dim} not divisible by lfr_window_size {lfr_m}"
            )));
        }
        let n_mels = feature_dim / lfr_m;

        let cmvn_neg_mean = parse_csv_vector(meta.get("neg_mean"), feature_dim)?;
        let cmvn_inv_stddev = parse_csv_vector(meta.get("inv_stddev"), feature_dim)?;

        let language_id = resolve_language_id(meta, &config.language);
        let text_norm_id = resolve_text_norm_id(meta, &config.text_norm);

        Ok(Self {
            mode: ModelMode::CtcWithFeatures,
            expected_sample_rate: config.sample_rate,
            feature_dim,
            n_mels,
            lfr_window: lfr_m,
            lfr_shift: lfr_n,
            cmvn_neg_mean,
            cmvn_inv_stddev,
            language_id,
            text_norm_id,
            input_x_is_f16: x_input.is_float16,
            waveform_input_name: String::new(),
            waveform_input_is_f16: false,
            length_input: None,
            vocabulary,
            ctc_blank_id: 0,
            drop_leading_frames: CTC_DROP_LEADING_FRAMES,
            special_tokens: SPECIAL_TOKENS.iter().map(|s| s.to_string()).collect(),
            providers,
        })
    }

    fn build_waveform(
        inputs: &[InputDescriptor],
        vocabulary: Option<Vec<String>>,
        providers: Vec<String>,
    ) -> Result<Self> {
        let waveform_input = inputs
            .iter()
            .find(|i| i.is_float)
            .or_else(|| inputs.first())
            .ok_or_else(|| ProfileError::Invalid("onnx model has no inputs".into()))?;

        let length_input = inputs
            .iter()
            .find(|i| i.name != waveform_input.name && !i.is_float)
            .map(|i| (i.name.clone(), i.is_int64));

        Ok(Self {
            mode: ModelMode::WaveformDirect,
            expected_sample_rate: 16000,
            feature_dim: 0,
            n_mels: 0,
            lfr_window: 0,
            lfr_shift: 0,
            cmvn_neg_mean: Vec::new(),
            cmvn_inv_stddev: Vec::new(),
            language_id: 0,
            text_norm_id: 0,
            input_x_is_f16: false,
            waveform_input_name: waveform_input.name.clone(),
            waveform_input_is_f16: waveform_input.is_float16,
            length_input,
            vocabulary,
            ctc_blank_id: 0,
            drop_leading_frames: 0,
            special_tokens: SPECIAL_TOKENS.iter().map(|s| s.to_string()).collect(),
            providers,
        })
    }
}

fn parse_csv_vector(value: Option<&String>, expected_dim: usize) -> Result<Vec<f32>> {
    let value = value.ok_or_else(|| ProfileError::Invalid("missing cmvn vector in model metadata".into()))?;
    let parts: Vec<&str> = value.split(',').map(str::trim).filter(|s| !s.is_empty()).collect();
    if parts.len() != expected_dim {
        return Err(ProfileError::Invalid(format!(
            "cmvn vector dim mismatch: got={} expected={expected_dim}",
            parts.len()
        )));
    }
    parts
        .iter()
        .map(|p| p.parse::<f32>().map_err(|_| ProfileError::Invalid(format!("invalid cmvn value: {p}"))))
        .collect()
}

fn resolve_language_id(meta: &HashMap<String, String>, language: &str) -> i32 {
    let key = format!("lang_{}", language.trim().to_lowercase());
    let raw = meta.get(&key).or_else(|| meta.get("lang_auto"));
    raw.and_then(|v| v.parse().ok()).unwrap_or(0)
}

fn resolve_text_norm_id(meta: &HashMap<String, String>, text_norm: &str) -> i32 {
    let mode = text_norm.trim().to_lowercase();
    let key = if matches!(mode.as_str(), "with_itn" | "withitn" | "itn") {
        "with_itn"
    } else {
        "without_itn"
    };
    let raw = meta.get(key).or_else(|| meta.get("with_itn"));
    raw.and_then(|v| v.parse().ok()).unwrap_or(0)
}

fn load_vocabulary(meta: &HashMap<String, String>, model_path: &Path) -> Option<Vec<String>> {
    load_vocabulary_from_metadata(meta).or_else(|| load_vocabulary_from_sibling_files(model_path))
}

fn load_vocabulary_from_metadata(meta: &HashMap<String, String>) -> Option<Vec<String>> {
    for key in ["token_list", "tokens", "vocab", "char_list"] {
        let Some(raw) = meta.get(key) else { continue };
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }
        if raw.starts_with('[') {
            if let Ok(tokens) = serde_json::from_str::<Vec<String>>(raw) {
                return Some(tokens);
            }
            continue;
        }
        let tokens: Vec<String> = raw
            .lines()
            .map(|l| l.trim_end_matches('\n').to_string())
            .filter(|l| !l.trim().is_empty())
            .collect();
        if !tokens.is_empty() {
            return Some(tokens);
        }
    }
    None
}

fn load_vocabulary_from_sibling_files(model_path: &Path) -> Option<Vec<String>> {
    let stem = model_path.file_stem().map(|s| s.to_string_lossy().to_string())?;
    let parent = model_path.parent().unwrap_or_else(|| Path::new("."));
    let candidates: Vec<PathBuf> = vec![
        parent.join(format!("{stem}.tokens.txt")),
        parent.join(format!("{stem}.txt")),
        parent.join("tokens.txt"),
        parent.join("token_list.txt"),
        parent.join("vocab.txt"),
    ];
    for candidate in candidates {
        if let Ok(content) = std::fs::read_to_string(&candidate) {
            if let Some(tokens) = parse_token_file(&content) {
                return Some(tokens);
            }
        }
    }
    None
}

/// Parses a token file that is either one token per line, or
/// `<token> <id>` pairs; pair form yields an array sized to `max_id+1`
/// with unspecified indices filled with empty string. All-or-nothing:
/// if any non-empty line fails to parse as a pair, the whole file falls
/// back to plain line-per-token.
pub fn parse_token_file(content: &str) -> Option<Vec<String>> {
    let lines: Vec<&str> = content.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
    if lines.is_empty() {
        return None;
    }

    let mut pairs: Vec<(usize, String)> = Vec::with_capacity(lines.len());
    let mut all_pairs = true;
    for line in &lines {
        match line.rsplit_once(char::is_whitespace) {
            Some((tok, idx)) => match idx.trim().parse::<usize>() {
                Ok(id) => pairs.push((id, tok.trim().to_string())),
                Err(_) => {
                    all_pairs = false;
                    break;
                }
            },
            None => {
                all_pairs = false;
                break;
            }
        }
    }

    if !all_pairs || pairs.is_empty() {
        return Some(lines.iter().map(|s| s.to_string()).collect());
    }

    let max_id = pairs.iter().map(|(id, _)| *id).max().unwrap_or(0);
    let mut out = vec![String::new(); max_id + 1];
    for (id, tok) in pairs {
        if id < out.len() {
            out[id] = tok;
        }
    }
    Some(out)
}
