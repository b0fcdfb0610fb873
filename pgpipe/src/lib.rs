//! *Library for driving external OpenPGP command-line tools*
//!
//! `pgpipe` runs an OpenPGP-compatible program — GnuPG, PGP 5, or PGP 2.x —
//! to decrypt, encrypt, clear-sign, or detached-sign data on behalf of a
//! host application. The passphrase never appears on the tool's command
//! line or in the parent's environment, and the tool is detached from the
//! controlling terminal so it cannot fall back to prompting on `/dev/tty`:
//! the secret travels over a dedicated pipe, alongside the three standard
//! streams, all of them serviced by a single readiness-driven loop that
//! cannot deadlock against a tool that reads and writes at its own pace.
//!
//! The tool itself is treated as an opaque oracle: this crate manages
//! process and I/O semantics around it, not OpenPGP packets, keys, or
//! trust.
//!
//! # Example
//!
//! ```no_run
//! use pgpipe::{Backend, Callbacks, Pgp};
//! use secrecy::SecretString;
//!
//! struct PinnedPassphrase(String);
//!
//! impl Callbacks for PinnedPassphrase {
//!     fn request_passphrase(&self, _description: &str) -> Option<SecretString> {
//!         Some(SecretString::new(self.0.clone()))
//!     }
//! }
//!
//! # fn run() -> Result<(), pgpipe::Error> {
//! let pgp = Pgp::new(
//!     "/usr/bin/gpg",
//!     Backend::GnuPg,
//!     PinnedPassphrase("correct horse battery staple".into()),
//! );
//!
//! let recipients = vec!["alice@example.org".to_string()];
//! let ciphertext = pgp.encrypt(b"attack at dawn", &recipients, None)?;
//! let plaintext = pgp.decrypt(&ciphertext)?;
//! assert_eq!(plaintext, b"attack at dawn");
//! # Ok(())
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(missing_docs)]

use secrecy::SecretString;

/// Loads a localized string.
macro_rules! fl {
    ($message_id:literal) => {{
        i18n_embed_fl::fl!($crate::i18n::LANGUAGE_LOADER, $message_id)
    }};

    ($message_id:literal, $($args:expr),* $(,)?) => {{
        i18n_embed_fl::fl!($crate::i18n::LANGUAGE_LOADER, $message_id, $($args), *)
    }};
}

/// Writes a localized string to a formatter.
macro_rules! wfl {
    ($f:ident, $message_id:literal) => {
        write!($f, "{}", fl!($message_id))
    };

    ($f:ident, $message_id:literal, $($args:expr),* $(,)?) => {
        write!($f, "{}", fl!($message_id, $($args), *))
    };
}

mod backend;
mod error;
mod exec;
pub(crate) mod i18n;
mod protocol;

pub use backend::{Backend, HashAlgorithm};
pub use error::Error;
pub use i18n::localizer;
pub use protocol::Pgp;

// Re-export the crate used in our public API.
pub use secrecy;

/// Callbacks that the operations may trigger.
///
/// The implementation carries whatever context the host application needs
/// (a GUI handle, a terminal, a cached secret); the operations only see
/// this trait.
pub trait Callbacks {
    /// Requests the passphrase guarding the tool's secret key material.
    ///
    /// `description` is a ready-to-display prompt naming the tool and, when
    /// known, the signing identity. Returning `None` aborts the operation
    /// with [`Error::NoPassphrase`]; no process is launched in that case.
    fn request_passphrase(&self, description: &str) -> Option<SecretString>;
}

/// Returns whether `text` contains an armored PGP encrypted block.
pub fn contains_pgp_message(text: &str) -> bool {
    text.contains("-----BEGIN PGP MESSAGE-----")
}

/// Returns whether `text` contains an armored PGP clear-signed block.
pub fn contains_pgp_signed_message(text: &str) -> bool {
    text.contains("-----BEGIN PGP SIGNED MESSAGE-----")
}

#[cfg(test)]
mod tests {
    use super::{contains_pgp_message, contains_pgp_signed_message};

    #[test]
    fn detects_encrypted_block() {
        assert!(contains_pgp_message(
            "Dear Bob,\n-----BEGIN PGP MESSAGE-----\nhQEMA...\n-----END PGP MESSAGE-----\n"
        ));
        assert!(!contains_pgp_message("just some mail"));
    }

    #[test]
    fn detects_signed_block() {
        assert!(contains_pgp_signed_message(
            "-----BEGIN PGP SIGNED MESSAGE-----\nHash: SHA1\n\nhello\n"
        ));
        assert!(!contains_pgp_signed_message(
            "-----BEGIN PGP MESSAGE-----\nhQEMA...\n"
        ));
    }
}
