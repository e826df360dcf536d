//! Error taxonomy for the inspection service.
//!
//! Each variant carries the user-facing (Indonesian) toast text through its
//! `Display` impl, so the API layer can surface a single message per failed
//! user action.

use thiserror::Error;
use uuid::Uuid;

/// Crate-wide result alias
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Missing or malformed input, rejected before any network call
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Masukkan nama shipper")]
    EmptyShipperName,

    #[error("Pilih shipper dan tambahkan minimal 1 container!")]
    MissingShipperOrContainers,

    /// `index` is 1-based, matching the form's "Container N" headings
    #[error("Container {index} belum lengkap foto-fotonya!")]
    IncompletePhotos { index: usize },

    #[error("Foto container {index} tidak valid: {reason}")]
    InvalidPhoto { index: usize, reason: String },

    #[error("Container {index} tidak ditemukan di formulir")]
    UnknownDraft { index: usize },

    #[error("Format timestamp tidak valid: {0}")]
    InvalidTimestamp(String),

    #[error("Penghapusan {0} harus dikonfirmasi")]
    ConfirmationRequired(&'static str),
}

/// Remote row-store failures
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Gagal mengakses database: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{entity} {id} tidak ditemukan")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("Shipper {shipper_id} tidak valid")]
    InvalidReference { shipper_id: Uuid },

    #[error(transparent)]
    Invalid(#[from] ValidationError),

    #[error("Penyimpanan data tidak tersedia: {0}")]
    Unavailable(String),
}

/// Object-store upload failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UploadError {
    #[error("Foto {path} sudah ada")]
    Conflict { path: String },

    #[error("Kuota penyimpanan foto terlampaui ({path})")]
    QuotaExceeded { path: String },

    #[error("Gagal mengunggah foto {path}: {message}")]
    Failed { path: String, message: String },
}

/// URL signing failures. Never surfaced to users: callers fall back to the
/// stored URL.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SigningError {
    #[error("URL {url} is outside bucket {bucket}")]
    OutsideBucket { url: String, bucket: String },

    #[error("Failed to sign {path}: {message}")]
    Failed { path: String, message: String },
}

/// Geolocation failures reported by the device bridge
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LocationError {
    #[error("Gagal mendapatkan lokasi: izin ditolak")]
    PermissionDenied,

    #[error("Gagal mendapatkan lokasi: {0}")]
    Unavailable(String),
}

/// Session and permission failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Silakan masuk terlebih dahulu")]
    NoSession,

    /// Missing, malformed, forged or expired access token
    #[error("Sesi tidak valid, silakan masuk kembali")]
    InvalidToken,

    #[error("Hanya admin yang dapat melakukan aksi ini")]
    AdminRequired,
}

/// Top-level error for a user action
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Upload(#[from] UploadError),

    #[error(transparent)]
    Signing(#[from] SigningError),

    #[error(transparent)]
    Location(#[from] LocationError),

    #[error(transparent)]
    Auth(#[from] AuthError),
}

impl Error {
    /// Stable machine-readable code for API error bodies
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation(ValidationError::ConfirmationRequired(_)) => {
                "CONFIRMATION_REQUIRED"
            }
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::Store(StoreError::NotFound { .. }) => "NOT_FOUND",
            Error::Store(StoreError::InvalidReference { .. }) => "INVALID_REFERENCE",
            Error::Store(StoreError::Invalid(_)) => "VALIDATION_ERROR",
            Error::Store(_) => "STORE_ERROR",
            Error::Upload(UploadError::Conflict { .. }) => "UPLOAD_CONFLICT",
            Error::Upload(_) => "UPLOAD_ERROR",
            Error::Signing(_) => "SIGNING_ERROR",
            Error::Location(_) => "LOCATION_ERROR",
            Error::Auth(AuthError::NoSession) => "NO_SESSION",
            Error::Auth(AuthError::InvalidToken) => "INVALID_TOKEN",
            Error::Auth(AuthError::AdminRequired) => "ADMIN_REQUIRED",
        }
    }

    /// Message shown in the failure toast
    pub fn user_message(&self) -> String {
        match self {
            Error::Store(StoreError::Database(_)) => "Gagal menyimpan data".to_string(),
            Error::Upload(e) => format!("Gagal menyimpan data: {e}"),
            other => other.to_string(),
        }
    }
}
