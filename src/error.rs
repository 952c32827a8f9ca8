use thiserror::Error;

/// Crate-wide error type. Session handlers map the filesystem-ish variants
/// to a single FTP reply and keep going; transport and timeout variants end
/// the session.
#[derive(Debug, Error)]
pub enum FtpError {
  #[error("permission denied: {0}")]
  PermissionDenied(String),

  #[error("not found: {0}")]
  NotFound(String),

  #[error("invalid credentials")]
  InvalidCredentials,

  #[error("unexpected reply {code} {text}")]
  Protocol { code: u16, text: String },

  #[error("transport error: {0}")]
  Transport(#[from] std::io::Error),

  #[error("timed out waiting for {0}")]
  Timeout(&'static str),

  #[error("configuration error: {0}")]
  Config(String),

  #[error("user store error: {0}")]
  Store(String),
}

pub type Result<T> = std::result::Result<T, FtpError>;
