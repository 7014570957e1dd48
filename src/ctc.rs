//! CTC Decoder: turns the raw output tensors from the Inference Engine
//! into text, per the blank/repeat-collapsing and vocabulary-lookup
//! rules described by the model profile.

use ort::session::SessionOutputs;

use crate::model::ModelProfile;

#[derive(Debug, thiserror::Error)]
pub enum CtcError {
    #[error("failed to read model output: {0}")]
    OutputRead(String),
}

pub type Result<T> = std::result::Result<T, CtcError>;

const MAX_ID_PREVIEW: usize = 64;

/// Decodes a full set of ONNX output tensors to text.
pub fn decode_outputs(outputs: &SessionOutputs, profile: &ModelProfile) -> Result<String> {
    if let Some(text) = try_extract_text(outputs) {
        return Ok(text);
    }

    let Some(token_ids) = extract_token_ids(outputs, profile.drop_leading_frames) else {
        return Ok("[asr_output_unhandled]".to_string());
    };

    Ok(decode_token_ids(&token_ids, profile))
}

fn try_extract_text(outputs: &SessionOutputs) -> Option<String> {
    for (_name, value) in outputs.iter() {
        if let Ok(strings) = value.try_extract_strings() {
            if let Some(first) = strings.into_iter().next() {
                return Some(first);
            }
        }
    }
    None
}

fn extract_token_ids(outputs: &SessionOutputs, drop_first: usize) -> Option<Vec<i64>> {
    let mut int_candidate: Option<Vec<i64>> = None;
    let mut float_candidate: Option<Vec<i64>> = None;

    for (_name, value) in outputs.iter() {
        if int_candidate.is_none() {
            if let Ok((shape, data)) = value.try_extract_tensor::<i64>() {
                int_candidate = row_from_tensor(shape, data);
            } else if let Ok((shape, data)) = value.try_extract_tensor::<i32>() {
                let data: Vec<i64> = data.iter().map(|&v| v as i64).collect();
                int_candidate = row_from_tensor(shape, &data);
            }
        }
        if int_candidate.is_none() && float_candidate.is_none() {
            if let Ok((shape, data)) = value.try_extract_tensor::<f32>() {
                float_candidate = argmax_last_axis(shape, data);
            }
        }
    }

    let ids = int_candidate.or(float_candidate)?;
    Some(if drop_first > 0 && drop_first <= ids.len() {
        ids[drop_first..].to_vec()
    } else if drop_first > 0 {
        Vec::new()
    } else {
        ids
    })
}

fn row_from_tensor(shape: &[i64], data: &[i64]) -> Option<Vec<i64>> {
    match shape.len() {
        2 if shape[0] >= 1 => {
            let row_len = shape[1] as usize;
            Some(data[..row_len].to_vec())
        }
        1 => Some(data.to_vec()),
        _ => None,
    }
}

fn argmax_last_axis(shape: &[i64], data: &[f32]) -> Option<Vec<i64>> {
    if shape.len() != 3 || shape[0] < 1 {
        return None;
    }
    let t = shape[1] as usize;
    let v = shape[2] as usize;
    let mut out = Vec::with_capacity(t);
    for step in 0..t {
        let row = &data[step * v..(step + 1) * v];
        let (best_idx, _) = row
            .iter()
            .enumerate()
            .fold((0usize, f32::NEG_INFINITY), |acc, (i, &val)| {
                if val > acc.1 {
                    (i, val)
                } else {
                    acc
                }
            });
        out.push(best_idx as i64);
    }
    Some(out)
}

/// Collapses CTC output to text: skips blanks, immediate repeats,
/// out-of-range ids and special tokens, then detokenizes.
///
/// The "previous non-blank" tracker updates for every visited token,
/// blank or not, before the range/special-token checks run — so a
/// special token or out-of-range id still becomes "previous" for
/// repeat detection on the next step even though it contributes no text.
fn decode_token_ids(token_ids: &[i64], profile: &ModelProfile) -> String {
    let Some(vocabulary) = &profile.vocabulary else {
        return preview_token_ids(token_ids);
    };

    let blank_id = profile.ctc_blank_id;
    let mut out_tokens: Vec<&str> = Vec::new();
    let mut prev: Option<i64> = None;

    for &tid in token_ids {
        if tid == blank_id {
            prev = Some(tid);
            continue;
        }
        if prev == Some(tid) {
            continue;
        }
        prev = Some(tid);

        if tid < 0 || tid as usize >= vocabulary.len() {
            continue;
        }
        let tok = vocabulary[tid as usize].as_str();
        if profile.special_tokens.iter().any(|s| s == tok) {
            continue;
        }
        out_tokens.push(tok);
    }

    let text = out_tokens.concat();
    let text = text.replace('\u{2581}', " ").replace("<space>", " ");
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn preview_token_ids(token_ids: &[i64]) -> String {
    let truncated = token_ids.len() > MAX_ID_PREVIEW;
    let ids: Vec<String> = token_ids
        .iter()
        .take(MAX_ID_PREVIEW)
        .map(|id| id.to_string())
        .collect();
    format!(
        "[token_ids={}{}]",
        ids.join(", "),
        if truncated { "..." } else { "" }
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelMode;

    fn profile_with_vocab(vocab: Vec<&str>) -> ModelProfile {
        ModelProfile {
            mode: ModelMode::CtcWithFeatures,
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
            waveform_input_name: String::new(),
            waveform_input_is_f16: false,
            length_input: None,
            vocabulary: Some(vocab.into_iter().map(str::to_string).collect()),
            ctc_blank_id: 0,
            drop_leading_frames: 0,
            special_tokens: vec!["<blank>".into(), "<s>".into(), "</s>".into()],
            providers: Vec::new(),
        }
    }

    #[test]
    fn decode_token_ids_should_collapse_blanks_and_repeats() {
        let profile = profile_with_vocab(vec!["<blank>", "hello", "world"]);
        let ids = vec![0, 1, 1, 0, 2, 2, 0];
        let text = decode_token_ids(&ids, &profile);
        assert_eq!(text, "helloworld");
    }

    #[test]
    fn decode_token_ids_should_skip_special_tokens_but_update_repeat_tracker() {
        let profile = profile_with_vocab(vec!["<blank>", "hello", "<s>"]);
        // "<s>" (id 2) is skipped from output but still becomes "prev",
        // so a second consecutive 2 stays collapsed too.
        let ids = vec![1, 2, 2, 1];
        let text = decode_token_ids(&ids, &profile);
        assert_eq!(text, "hellohello");
    }

    #[test]
    fn decode_token_ids_should_replace_subword_marker_with_space() {
        let profile = profile_with_vocab(vec!["<blank>", "\u{2581}hi", "\u{2581}there"]);
        let ids = vec![1, 2];
        let text = decode_token_ids(&ids, &profile);
        assert_eq!(text, "hi there");
    }

    #[test]
    fn decode_token_ids_should_skip_out_of_range_ids() {
        let profile = profile_with_vocab(vec!["<blank>", "hi"]);
        let ids = vec![1, 99];
        let text = decode_token_ids(&ids, &profile);
        assert_eq!(text, "hi");
    }

    #[test]
    fn preview_token_ids_should_truncate_past_64_with_ellipsis() {
        let ids: Vec<i64> = (0..70).collect();
        let text = preview_token_ids(&ids);
        assert!(text.starts_with("[token_ids=0, 1, 2"));
        assert!(text.ends_with("...]"));
    }

    #[test]
    fn preview_token_ids_should_omit_ellipsis_when_not_truncated() {
        let ids = vec![1, 2, 3];
        let text = preview_token_ids(&ids);
        assert_eq!(text, "[token_ids=1, 2, 3]");
    }
}
