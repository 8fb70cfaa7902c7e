use std::fmt;
use thiserror::Error;

/// Pipeline stage a failure is attributed to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Keyset,
    Header,
    MetadataInfo,
    Metadata,
    Section,
    Executable,
    License,
    Signature,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Keyset => "keyset",
            Stage::Header => "container header",
            Stage::MetadataInfo => "metadata info",
            Stage::Metadata => "metadata",
            Stage::Section => "section",
            Stage::Executable => "executable",
            Stage::License => "license block",
            Stage::Signature => "signature",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("authentication failed while decrypting {stage}")]
    AuthenticationFailed { stage: Stage },

    #[error("integrity digest mismatch for section {section}")]
    DigestMismatch { section: u32 },

    #[error("cipher setup failed: {0}")]
    Cipher(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransformError {
    #[error("unsupported segment layout: {0}")]
    UnsupportedSegmentLayout(String),

    #[error("malformed executable: {0}")]
    MalformedInput(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LicenseError {
    #[error("license key does not reproduce the bound key")]
    KeyMismatch,

    #[error("content id / filename hash mismatch")]
    FilenameMismatch,

    #[error("license type {0} requires a klicensee")]
    MissingLicenseKey(String),

    #[error("invalid license parameter: {0}")]
    InvalidParameter(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IntegrityError {
    #[error("container signature is invalid")]
    SignatureInvalid,

    #[error("license block signature is invalid")]
    LicenseSignatureInvalid,
}

#[derive(Error, Debug)]
pub enum SceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Keyset load error: {0}")]
    Load(String),

    #[error("Invalid {stage} format: {message}")]
    Format { stage: Stage, message: String },

    #[error("No key entry for {0}")]
    KeyNotFound(String),

    #[error("License error: {0}")]
    License(#[from] LicenseError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Transform error: {0}")]
    Transform(#[from] TransformError),

    #[error("Integrity error: {0}")]
    Integrity(#[from] IntegrityError),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl SceError {
    pub(crate) fn format(stage: Stage, message: impl Into<String>) -> Self {
        SceError::Format {
            stage,
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SceError>;
