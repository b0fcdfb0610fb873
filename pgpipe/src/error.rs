//! Error type.

use std::fmt;
use std::io;

use crate::backend::{Backend, HashAlgorithm};

/// The various errors that can be returned while driving the external tool.
#[derive(Debug)]
pub enum Error {
    /// The selected backend cannot honor the requested digest algorithm
    /// for a detached signature.
    ///
    /// Only GnuPG exposes a digest selector; silently producing a
    /// signature with a different digest than the caller asked for would
    /// be worse than refusing.
    HashNotSupported {
        /// The backend that lacks digest selection.
        backend: Backend,
        /// The digest that was requested.
        hash: HashAlgorithm,
    },
    /// The tool could not be started.
    Launch {
        /// The binary that was being launched.
        binary: String,
        /// The underlying pipe/spawn error.
        source: io::Error,
    },
    /// The passphrase callback declined to provide a passphrase.
    NoPassphrase,
    /// Encryption was requested with an empty recipient list.
    NoRecipients,
    /// The tool ran but failed.
    ToolFailed {
        /// The tool's diagnostics (its standard-error output), or a fixed
        /// message when it produced none.
        diagnostics: String,
    },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::HashNotSupported { backend, hash } => wfl!(
                f,
                "err-hash-not-supported",
                tool = backend.display_name(),
                hash = hash.digest_name(),
            ),
            Error::Launch { binary, source } => wfl!(
                f,
                "err-launch",
                binary = binary.as_str(),
                err = source.to_string(),
            ),
            Error::NoPassphrase => wfl!(f, "err-no-passphrase"),
            Error::NoRecipients => wfl!(f, "err-no-recipients"),
            Error::ToolFailed { diagnostics } => write!(f, "{}", diagnostics),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Launch { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Error;

    #[test]
    fn messages_are_rendered() {
        assert!(Error::NoPassphrase.to_string().contains("password"));
        assert!(Error::NoRecipients.to_string().contains("recipients"));
    }

    #[test]
    fn tool_diagnostics_pass_through_verbatim() {
        let err = Error::ToolFailed {
            diagnostics: "gpg: decryption failed: No secret key".into(),
        };
        assert_eq!(err.to_string(), "gpg: decryption failed: No secret key");
    }
}
