//! Wire-level error taxonomy shared by every component.

use serde::Serialize;

/// Closed set of failure kinds a caller or operator can observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    InvalidArtifact,
    NotFound,
    InUse,
    UnknownArtifact,
    UnknownModel,
    NoHistory,
    LoadError,
    DrainTimeout,
    InvalidInput,
    InferenceError,
    ModelUnavailable,
    Timeout,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidArtifact => "InvalidArtifact",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::InUse => "InUse",
            ErrorKind::UnknownArtifact => "UnknownArtifact",
            ErrorKind::UnknownModel => "UnknownModel",
            ErrorKind::NoHistory => "NoHistory",
            ErrorKind::LoadError => "LoadError",
            ErrorKind::DrainTimeout => "DrainTimeout",
            ErrorKind::InvalidInput => "InvalidInput",
            ErrorKind::InferenceError => "InferenceError",
            ErrorKind::ModelUnavailable => "ModelUnavailable",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::Internal => "Internal",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            ErrorKind::UnknownModel | ErrorKind::NotFound | ErrorKind::UnknownArtifact => 404,
            ErrorKind::InvalidInput | ErrorKind::InvalidArtifact => 400,
            ErrorKind::InUse | ErrorKind::NoHistory => 409,
            ErrorKind::LoadError => 422,
            ErrorKind::ModelUnavailable => 503,
            ErrorKind::Timeout => 504,
            ErrorKind::InferenceError | ErrorKind::DrainTimeout | ErrorKind::Internal => 500,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(self.as_str()) }
}
