//! LVM error taxonomy

use thiserror::Error;

/// Failure of an LVM primitive
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LvmError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("physical volume already in a volume group: {0}")]
    PvAlreadyInVolumeGroup(String),

    #[error("insufficient space: {0}")]
    ResourceExhausted(String),

    #[error("{command} failed: {message}")]
    Other { command: String, message: String },
}

pub type LvmResult<T> = std::result::Result<T, LvmError>;

impl LvmError {
    /// Classify the stderr of a failed LVM command
    pub fn from_stderr(command: &str, stderr: &str) -> Self {
        let message = stderr.trim().to_string();
        let lower = message.to_lowercase();

        if lower.contains("already in volume group") {
            LvmError::PvAlreadyInVolumeGroup(message)
        } else if lower.contains("already exists") {
            LvmError::AlreadyExists(message)
        } else if lower.contains("insufficient free space")
            || lower.contains("insufficient suitable")
            || lower.contains("not enough free")
        {
            LvmError::ResourceExhausted(message)
        } else if lower.contains("not found")
            || lower.contains("failed to find")
            || lower.contains("cannot find")
            || lower.contains("no such")
        {
            LvmError::NotFound(message)
        } else {
            LvmError::Other {
                command: command.to_string(),
                message,
            }
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, LvmError::NotFound(_))
    }

    /// The kernel refused because the device is open
    pub fn is_device_busy(&self) -> bool {
        match self {
            LvmError::Other { message, .. } => {
                let lower = message.to_lowercase();
                lower.contains("in use") || lower.contains("is used by another device")
            }
            _ => false,
        }
    }
}

/// Collapse [`LvmError::NotFound`] into `Ok(None)`
pub trait IgnoreNotFound<T> {
    fn ignore_not_found(self) -> LvmResult<Option<T>>;
}

impl<T> IgnoreNotFound<T> for LvmResult<T> {
    fn ignore_not_found(self) -> LvmResult<Option<T>> {
        match self {
            Ok(v) => Ok(Some(v)),
            Err(LvmError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
