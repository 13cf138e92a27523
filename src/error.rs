//! Error taxonomy shared by the sandbox, session and shell layers.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecoyError {
    /// A requested path resolved outside the sandbox root.
    #[error("path escapes sandbox root: {0}")]
    PathEscape(String),

    #[error("mount failure on {target}: {errno}")]
    MountFailure { target: PathBuf, errno: nix::errno::Errno },

    /// The sandbox backing this operation is not mounted.
    #[error("sandbox not mounted: {0}")]
    Unmounted(String),

    #[error("no such file or directory: {0}")]
    NotFound(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("is a directory: {0}")]
    IsADirectory(String),

    #[error("protocol decode error: {0}")]
    ProtocolDecode(String),

    #[error("invalid session identity: {0}")]
    SessionIdentity(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("ssh: {0}")]
    Ssh(#[from] russh::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type DecoyResult<T> = Result<T, DecoyError>;

impl DecoyError {
    /// Map an OS error raised while touching `path` onto the taxonomy.
    pub fn from_io(err: io::Error, path: &str) -> Self {
        use nix::errno::Errno;

        if err.kind() == io::ErrorKind::NotFound {
            return DecoyError::NotFound(path.to_string());
        }
        match err.raw_os_error().map(Errno::from_raw) {
            Some(Errno::ENOTDIR) => DecoyError::NotADirectory(path.to_string()),
            Some(Errno::EISDIR) => DecoyError::IsADirectory(path.to_string()),
            _ => DecoyError::Io(err),
        }
    }

    /// Shell-style suffix shown to the remote peer, e.g.
    /// `cat: foo: No such file or directory`. Never includes host paths.
    pub fn shell_message(&self) -> &'static str {
        match self {
            DecoyError::NotFound(_) | DecoyError::PathEscape(_) => "No such file or directory",
            DecoyError::NotADirectory(_) => "Not a directory",
            DecoyError::IsADirectory(_) => "Is a directory",
            DecoyError::Io(e) if e.kind() == io::ErrorKind::PermissionDenied => "Permission denied",
            DecoyError::Io(e) if e.kind() == io::ErrorKind::AlreadyExists => "File exists",
            DecoyError::MountFailure { .. } | DecoyError::Unmounted(_) | DecoyError::Io(_) => {
                "Input/output error"
            }
            _ => "Operation not permitted",
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, DecoyError::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_map_to_taxonomy() {
        let err = DecoyError::from_io(io::Error::from(io::ErrorKind::NotFound), "/etc/x");
        assert!(err.is_not_found());
        assert_eq!(err.shell_message(), "No such file or directory");
    }

    #[test]
    fn path_escape_looks_like_missing_file() {
        let err = DecoyError::PathEscape("../../etc/passwd".into());
        assert_eq!(err.shell_message(), "No such file or directory");
    }
}
