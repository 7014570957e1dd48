/// Top-level error type for the service.
///
/// Each variant corresponds to one pipeline component (§4 of the design).
/// The `Display` text is what ends up verbatim in an outbound `error` frame,
/// so wording changes here are wire-visible.
#[derive(Debug, thiserror::Error)]
#[allow(dead_code)]
pub enum AppError {
    #[error("{0}")]
    Mux(#[from] crate::audio::mux::MuxError),

    #[error("audio decode failed: {0}")]
    Decode(String),

    #[error("{0}")]
    Feature(#[from] crate::feature::FeatureError),

    #[error("model profile invalid: {0}")]
    Profile(String),

    #[error("{0}")]
    Inference(#[from] crate::inference::InferenceError),

    #[error("{0}")]
    Protocol(String),

    #[error("config error: {0}")]
    Config(String),
}

impl From<crate::audio::decode::DecodeError> for AppError {
    fn from(err: crate::audio::decode::DecodeError) -> Self {
        AppError::Decode(err.to_string())
    }
}

impl From<crate::model::ProfileError> for AppError {
    fn from(err: crate::model::ProfileError) -> Self {
        AppError::Profile(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Config(err.to_string())
    }
}

#[allow(dead_code)]
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_error_should_display_bare_message() {
        let error = AppError::Protocol("stop before start".to_string());
        assert_eq!(error.to_string(), "stop before start");
    }

    #[test]
    fn app_error_should_convert_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let app_err: AppError = io_err.into();
        assert!(matches!(app_err, AppError::Config(_)));
        assert!(app_err.to_string().contains("file not found"));
    }
}
