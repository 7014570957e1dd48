//! Session Core: the per-connection state machine binding the Ogg
//! Muxer, Audio Decoder and Inference Engine into the `start` /
//! binary-frame / `stop` / `ping` protocol.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::audio::decode;
use crate::inference::Recognizer;

const TRACE_ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
const DEFAULT_SAMPLE_RATE: u32 = 48000;

/// Generates a 6-character base62 id from the low 32 bits of the
/// current time in microseconds: repeated base-62 division yields
/// digits least-significant first, filled back-to-front so the
/// resulting string reads most-significant digit first.
pub fn generate_trace_id() -> String {
    let micros = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros())
        .unwrap_or(0);
    let mut n = (micros & 0xFFFF_FFFF) as u32;
    let mut out = [0u8; 6];
    for slot in out.iter_mut().rev() {
        *slot = TRACE_ID_ALPHABET[(n % 62) as usize];
        n /= 62;
    }
    String::from_utf8(out.to_vec()).expect("alphabet is ASCII")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Idle,
    Capturing,
    Finalizing,
}

#[derive(Debug, Clone)]
pub struct SessionState {
    pub trace_id: Option<String>,
    pub sample_rate: Option<u32>,
    pub context: Value,
    pub use_cloud_api: bool,
    pub packets: Vec<Vec<u8>>,
    pub packet_count: usize,
    pub total_bytes: usize,
    pub lifecycle: Lifecycle,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            trace_id: None,
            sample_rate: None,
            context: Value::Null,
            use_cloud_api: false,
            packets: Vec::new(),
            packet_count: 0,
            total_bytes: 0,
            lifecycle: Lifecycle::Idle,
        }
    }
}

impl SessionState {
    fn reset_audio(&mut self) {
        self.packets.clear();
        self.packet_count = 0;
        self.total_bytes = 0;
    }
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    Pong,
    FastText {
        trace_id: String,
        content: String,
        is_final: bool,
    },
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        trace_id: Option<String>,
        message: String,
    },
}

impl OutboundMessage {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("outbound message always serializes")
    }

    fn error(message: impl Into<String>, trace_id: Option<String>) -> Self {
        OutboundMessage::Error {
            trace_id,
            message: message.into(),
        }
    }
}

/// Result of one finalization pipeline run, delivered asynchronously
/// once the background worker completes.
struct FinalizeCompletion {
    trace_id: String,
    outcome: Result<String, String>,
}

/// One §4.7 state machine per connection. Owns its buffers exclusively;
/// the recognizer is shared by reference across all sessions.
///
/// `stop` never blocks the message loop on the decode/inference
/// pipeline: it spawns the work and returns immediately, so `ping` (and
/// a same-state-rejected second `stop`) stay responsive while a
/// finalization is in flight. The caller drives this by racing
/// [`SessionCore::next_finalize_result`] against the next inbound frame.
pub struct SessionCore {
    pub state: SessionState,
    recognizer: Arc<dyn Recognizer>,
    finalize_tx: mpsc::UnboundedSender<FinalizeCompletion>,
    finalize_rx: mpsc::UnboundedReceiver<FinalizeCompletion>,
}

impl SessionCore {
    pub fn new(recognizer: Arc<dyn Recognizer>) -> Self {
        let (finalize_tx, finalize_rx) = mpsc::unbounded_channel();
        Self {
            state: SessionState::default(),
            recognizer,
            finalize_tx,
            finalize_rx,
        }
    }

    /// Parses one inbound text frame and returns zero or more outbound
    /// messages to send back, in order. Never blocks on the
    /// decode/inference pipeline; `stop` dispatches that work to a
    /// background task and returns immediately with an empty list, the
    /// eventual result arriving through [`Self::next_finalize_result`].
    pub fn handle_text(&mut self, raw: &str) -> Vec<OutboundMessage> {
        let value: Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(_) => {
                return vec![OutboundMessage::error(
                    "invalid json",
                    self.state.trace_id.clone(),
                )]
            }
        };

        let msg_type = value.get("type").and_then(Value::as_str);

        match msg_type {
            Some("ping") => vec![OutboundMessage::Pong],
            Some("start") => {
                self.handle_start(&value);
                Vec::new()
            }
            Some("stop") => self.handle_stop(),
            Some(other) => vec![OutboundMessage::error(
                format!("unknown type: {other}"),
                self.state.trace_id.clone(),
            )],
            None => vec![OutboundMessage::error(
                "unknown type: null",
                self.state.trace_id.clone(),
            )],
        }
    }

    /// Appends a raw Opus packet to the buffer, but only while
    /// `Capturing`; binary frames outside that state are dropped rather
    /// than silently accumulated (see SPEC_FULL.md's resolved open
    /// question on this point).
    pub fn handle_binary(&mut self, packet: Vec<u8>) {
        if self.state.lifecycle != Lifecycle::Capturing {
            return;
        }
        self.state.total_bytes += packet.len();
        self.state.packet_count += 1;
        self.state.packets.push(packet);
    }

    fn handle_start(&mut self, value: &Value) {
        let trace_id = value
            .get("trace_id")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(generate_trace_id);

        let sample_rate = value
            .get("sample_rate")
            .and_then(Value::as_u64)
            .map(|v| v as u32)
            .unwrap_or(DEFAULT_SAMPLE_RATE);

        let context = value.get("context").cloned().unwrap_or(Value::Null);
        let use_cloud_api = value
            .get("use_cloud_api")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        self.state.trace_id = Some(trace_id);
        self.state.sample_rate = Some(sample_rate);
        self.state.context = context;
        self.state.use_cloud_api = use_cloud_api;
        self.state.reset_audio();
        self.state.lifecycle = Lifecycle::Capturing;
    }

    /// Accepts or rejects a `stop`. Acceptance moves the buffer out of
    /// `SessionState` and hands it to a detached task; nothing here
    /// awaits that task, so a second `stop` arriving before it completes
    /// observes `Finalizing` (not `Capturing`) and is rejected
    /// synchronously without starting a parallel pipeline.
    fn handle_stop(&mut self) -> Vec<OutboundMessage> {
        if self.state.lifecycle != Lifecycle::Capturing {
            let trace_id = self.state.trace_id.clone();
            self.state.reset_audio();
            return vec![OutboundMessage::error("stop before start", trace_id)];
        }

        self.state.lifecycle = Lifecycle::Finalizing;
        let trace_id = self.state.trace_id.clone().unwrap_or_default();
        let sample_rate = self.state.sample_rate.unwrap_or(DEFAULT_SAMPLE_RATE);
        let packets = std::mem::take(&mut self.state.packets);
        self.state.reset_audio();

        let recognizer = Arc::clone(&self.recognizer);
        let tx = self.finalize_tx.clone();
        tokio::spawn(run_finalize_pipeline(trace_id, sample_rate, packets, recognizer, tx));

        Vec::new()
    }

    /// Awaits the next completed finalization and turns it into outbound
    /// messages, returning `Finalizing` to `Idle` if no newer `start`
    /// has already moved the session on. The connection loop races this
    /// against the next inbound frame (see `transport::handle_connection`).
    pub async fn next_finalize_result(&mut self) -> Vec<OutboundMessage> {
        let Some(completion) = self.finalize_rx.recv().await else {
            return Vec::new();
        };
        self.apply_finalize_completion(completion)
    }

    fn apply_finalize_completion(&mut self, completion: FinalizeCompletion) -> Vec<OutboundMessage> {
        if self.state.lifecycle == Lifecycle::Finalizing {
            self.state.lifecycle = Lifecycle::Idle;
        }

        match completion.outcome {
            Ok(text) => vec![OutboundMessage::FastText {
                trace_id: completion.trace_id,
                content: text,
                is_final: true,
            }],
            Err(message) if message.starts_with("audio decode failed") => {
                tracing::error!(
                    trace_id = %completion.trace_id,
                    error = %message,
                    "Audio decode failed | 音频解码失败"
                );
                vec![OutboundMessage::error(message, Some(completion.trace_id))]
            }
            Err(message) => {
                tracing::error!(trace_id = %completion.trace_id, error = %message, "asr failed");
                let placeholder = format!("[asr_error: {message}]");
                vec![
                    OutboundMessage::error(message, Some(completion.trace_id.clone())),
                    OutboundMessage::FastText {
                        trace_id: completion.trace_id,
                        content: placeholder,
                        is_final: true,
                    },
                ]
            }
        }
    }
}

/// Runs decode → recognize on the blocking pool and reports the result
/// back over `tx`. If the receiving session has already been dropped
/// (client disconnected), the send simply fails and the result is
/// discarded, per §4.7's "disconnect during Finalizing" semantics.
async fn run_finalize_pipeline(
    trace_id: String,
    sample_rate: u32,
    packets: Vec<Vec<u8>>,
    recognizer: Arc<dyn Recognizer>,
    tx: mpsc::UnboundedSender<FinalizeCompletion>,
) {
    let log_timings = std::env::var("GHOSTTYPE_LOG_TIMINGS").is_ok();
    let packet_count = packets.len();
    let total_bytes: usize = packets.iter().map(Vec::len).sum();
    let total_start = Instant::now();

    let joined = tokio::task::spawn_blocking(move || -> Result<(String, u128, u128), String> {
        let decode_start = Instant::now();
        let pcm = decode::decode_opus_packets_to_pcm(&packets, sample_rate)
            .map_err(|e| format!("audio decode failed: {e}"))?;
        let decode_micros = decode_start.elapsed().as_micros();

        let infer_start = Instant::now();
        let text = recognizer
            .transcribe(&pcm.pcm_s16le, pcm.sample_rate)
            .map_err(|e| e.to_string())?;
        let infer_micros = infer_start.elapsed().as_micros();

        Ok((text, decode_micros, infer_micros))
    })
    .await;

    let outcome = match joined {
        Ok(Ok((text, decode_micros, infer_micros))) => {
            if log_timings {
                tracing::info!(
                    trace_id = %trace_id,
                    packet_count,
                    total_bytes,
                    decode_us = decode_micros,
                    infer_us = infer_micros,
                    total_us = total_start.elapsed().as_micros(),
                    "utterance timings"
                );
            }
            Ok(text)
        }
        Ok(Err(message)) => Err(message),
        Err(join_err) => Err(format!("audio decode failed: worker task panicked: {join_err}")),
    };

    let _ = tx.send(FinalizeCompletion { trace_id, outcome });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::InferenceError;

    struct StubRecognizer;
    impl Recognizer for StubRecognizer {
        fn transcribe(&self, pcm: &[i16], sample_rate: u32) -> crate::inference::Result<String> {
            Ok(format!("[pcm_bytes={} sr={}]", pcm.len() * 2, sample_rate))
        }
    }

    struct FailingRecognizer;
    impl Recognizer for FailingRecognizer {
        fn transcribe(&self, _pcm: &[i16], _sample_rate: u32) -> crate::inference::Result<String> {
            Err(InferenceError::Failed("model exploded".to_string()))
        }
    }

    fn session() -> SessionCore {
        SessionCore::new(Arc::new(StubRecognizer))
    }

    #[tokio::test]
    async fn ping_should_reply_pong() {
        let mut s = session();
        let out = s.handle_text(r#"{"type":"ping"}"#);
        assert_eq!(out, vec![OutboundMessage::Pong]);
    }

    #[tokio::test]
    async fn unknown_type_should_report_the_type_verbatim() {
        let mut s = session();
        let out = s.handle_text(r#"{"type":"garble"}"#);
        assert_eq!(
            out,
            vec![OutboundMessage::Error {
                trace_id: None,
                message: "unknown type: garble".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn malformed_json_should_report_invalid_json_and_leave_state_unchanged() {
        let mut s = session();
        let out = s.handle_text("not json at all");
        assert_eq!(
            out,
            vec![OutboundMessage::Error {
                trace_id: None,
                message: "invalid json".to_string()
            }]
        );
        assert_eq!(s.state.lifecycle, Lifecycle::Idle);
    }

    #[tokio::test]
    async fn stop_before_start_should_error_without_fast_text() {
        let mut s = session();
        let out = s.handle_text(r#"{"type":"stop"}"#);
        assert_eq!(out.len(), 1);
        assert!(matches!(&out[0], OutboundMessage::Error { message, .. } if message == "stop before start"));
    }

    #[tokio::test]
    async fn empty_utterance_should_yield_empty_fast_text() {
        let mut s = session();
        s.handle_text(r#"{"type":"start","sample_rate":48000}"#);
        let immediate = s.handle_text(r#"{"type":"stop"}"#);
        assert!(immediate.is_empty(), "stop must not block on the pipeline");

        let out = s.next_finalize_result().await;
        match &out[0] {
            OutboundMessage::FastText { content, is_final, .. } => {
                assert_eq!(content, "");
                assert!(is_final);
            }
            other => panic!("expected fast_text, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn binary_frames_outside_capturing_should_be_dropped() {
        let mut s = session();
        s.handle_binary(vec![1, 2, 3]);
        assert_eq!(s.state.packet_count, 0);
    }

    #[tokio::test]
    async fn binary_frames_while_capturing_should_be_buffered() {
        let mut s = session();
        s.handle_text(r#"{"type":"start"}"#);
        s.handle_binary(vec![1, 2, 3]);
        s.handle_binary(vec![4, 5]);
        assert_eq!(s.state.packet_count, 2);
        assert_eq!(s.state.total_bytes, 5);
    }

    #[tokio::test]
    async fn second_start_should_reset_buffer_and_trace_id_without_error() {
        let mut s = session();
        s.handle_text(r#"{"type":"start","trace_id":"aaaaaa"}"#);
        s.handle_binary(vec![1, 2, 3]);
        s.handle_text(r#"{"type":"start","trace_id":"bbbbbb"}"#);
        assert_eq!(s.state.packet_count, 0);
        assert_eq!(s.state.trace_id.as_deref(), Some("bbbbbb"));
    }

    #[tokio::test]
    async fn inference_failure_should_send_error_then_placeholder_fast_text() {
        let mut s = SessionCore::new(Arc::new(FailingRecognizer));
        s.handle_text(r#"{"type":"start","sample_rate":16000}"#);
        // Silence: one minimal packet is enough to leave CtcWithFeatures
        // irrelevant here since the stub/failing recognizer never runs
        // the real front-end.
        s.handle_binary(vec![0x00]);
        s.handle_text(r#"{"type":"stop"}"#);
        let out = s.next_finalize_result().await;
        assert_eq!(out.len(), 2);
        assert!(matches!(&out[0], OutboundMessage::Error { message, .. } if message.contains("asr failed")));
        assert!(matches!(&out[1], OutboundMessage::FastText { content, .. } if content.starts_with("[asr_error:")));
    }

    #[tokio::test]
    async fn ping_during_finalization_should_reply_immediately() {
        let mut s = session();
        s.handle_text(r#"{"type":"start"}"#);
        let stop_out = s.handle_text(r#"{"type":"stop"}"#);
        assert!(stop_out.is_empty());

        // The pipeline is running in the background; `ping` must not
        // wait on it.
        let pong = s.handle_text(r#"{"type":"ping"}"#);
        assert_eq!(pong, vec![OutboundMessage::Pong]);

        let _ = s.next_finalize_result().await;
    }

    #[tokio::test]
    async fn second_stop_during_finalization_should_be_rejected_without_parallel_pipeline() {
        let mut s = session();
        s.handle_text(r#"{"type":"start"}"#);
        let first = s.handle_text(r#"{"type":"stop"}"#);
        assert!(first.is_empty());

        let second = s.handle_text(r#"{"type":"stop"}"#);
        assert_eq!(second.len(), 1);
        assert!(matches!(&second[0], OutboundMessage::Error { message, .. } if message == "stop before start"));

        // Only the first `stop` actually dispatched a pipeline: exactly
        // one completion is ever delivered.
        let out = s.next_finalize_result().await;
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn generate_trace_id_should_produce_six_base62_characters() {
        let id = generate_trace_id();
        assert_eq!(id.len(), 6);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
