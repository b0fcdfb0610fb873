//! The caller-facing operations: decrypt, encrypt, clear-sign, detached
//! sign. Each one is a thin parameterization of the same sequence —
//! acquire the passphrase, build the command line, run the exchange,
//! interpret the result.

use std::io;
use std::path::{Path, PathBuf};

use secrecy::SecretString;

use crate::backend::{Backend, HashAlgorithm, Operation};
use crate::error::Error;
use crate::exec::{self, PassphrasePipe, EXCHANGE_TIMEOUT_SECS};
use crate::Callbacks;

/// A configured external OpenPGP tool.
///
/// The value is immutable once constructed. Operations take `&self` and
/// may run concurrently from multiple threads; each call owns its own
/// child process and pipes, so calls never interfere with one another.
pub struct Pgp<C: Callbacks> {
    path: PathBuf,
    backend: Backend,
    callbacks: C,
}

impl<C: Callbacks> Pgp<C> {
    /// Configures a tool: the executable to run, the behavior family it
    /// belongs to, and the callbacks used to obtain the passphrase.
    pub fn new(path: impl Into<PathBuf>, backend: Backend, callbacks: C) -> Self {
        Pgp {
            path: path.into(),
            backend,
            callbacks,
        }
    }

    /// The configured executable.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The configured tool family.
    pub fn backend(&self) -> Backend {
        self.backend
    }

    /// Decrypts `ciphertext`.
    ///
    /// The result is returned exactly as the tool produced it; decrypted
    /// content may be binary, so treat it as bytes, not text.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, Error> {
        self.run(Operation::Decrypt, ciphertext, None)
    }

    /// Encrypts `plaintext` to `recipients`, returning armored ciphertext.
    ///
    /// `signer: Some(identity)` additionally signs as `identity`, which
    /// requires the passphrase; plain encryption never prompts for one.
    pub fn encrypt(
        &self,
        plaintext: &[u8],
        recipients: &[String],
        signer: Option<&str>,
    ) -> Result<Vec<u8>, Error> {
        if recipients.is_empty() {
            return Err(Error::NoRecipients);
        }
        self.run(
            Operation::Encrypt { recipients, signer },
            plaintext,
            signer,
        )
    }

    /// Clear-signs `plaintext`, wrapping it in a visible signature block.
    pub fn clearsign(&self, plaintext: &[u8], signer: Option<&str>) -> Result<Vec<u8>, Error> {
        self.run(Operation::Clearsign { signer }, plaintext, signer)
    }

    /// Produces a detached, armored signature over `plaintext` using the
    /// given digest.
    ///
    /// Fails with [`Error::HashNotSupported`] for backends that cannot
    /// honor a digest selection (see
    /// [`Backend::supports_digest_selection`]), before the passphrase
    /// callback is consulted.
    pub fn sign_detached(
        &self,
        plaintext: &[u8],
        signer: Option<&str>,
        hash: HashAlgorithm,
    ) -> Result<Vec<u8>, Error> {
        if !self.backend.supports_digest_selection() {
            return Err(Error::HashNotSupported {
                backend: self.backend,
                hash,
            });
        }
        self.run(Operation::DetachedSign { signer, hash }, plaintext, signer)
    }

    /// Asks the host application for the passphrase.
    fn request_passphrase(&self, identity: Option<&str>) -> Result<SecretString, Error> {
        let description = match identity {
            Some(identity) => fl!(
                "passphrase-prompt-for-identity",
                tool = self.backend.display_name(),
                identity = identity,
            ),
            None => fl!("passphrase-prompt", tool = self.backend.display_name()),
        };
        self.callbacks
            .request_passphrase(&description)
            .ok_or(Error::NoPassphrase)
    }

    /// The shared engine behind the four operations.
    fn run(
        &self,
        op: Operation<'_>,
        input: &[u8],
        identity: Option<&str>,
    ) -> Result<Vec<u8>, Error> {
        let passphrase = if op.needs_passphrase() {
            Some(self.request_passphrase(identity)?)
        } else {
            None
        };

        // The pipe must exist before the command line, which embeds the
        // descriptor number the child will inherit.
        let pipe = match passphrase {
            Some(_) => Some(PassphrasePipe::create().map_err(|errno| Error::Launch {
                binary: self.path.display().to_string(),
                source: io::Error::from_raw_os_error(errno as i32),
            })?),
            None => None,
        };

        let command = self
            .backend
            .command_line(&op, pipe.as_ref().map(PassphrasePipe::child_fd))?;

        let delivery = match (pipe, passphrase.as_ref()) {
            (Some(pipe), Some(secret)) => Some((pipe, secret)),
            _ => None,
        };

        let outcome = exec::exchange(&self.path, command, input, delivery)?;
        if outcome.succeeded() {
            Ok(outcome.output)
        } else {
            Err(self.interpret_failure(outcome))
        }
    }

    /// Turns a failed run into a diagnosis for the caller: the tool's own
    /// stderr when it said anything, a fixed message otherwise.
    fn interpret_failure(&self, outcome: exec::Outcome) -> Error {
        let diagnostics = String::from_utf8_lossy(&outcome.diagnostics).into_owned();
        let message = if outcome.timed_out {
            let timeout = fl!(
                "err-tool-timed-out",
                binary = self.path.display().to_string(),
                seconds = EXCHANGE_TIMEOUT_SECS,
            );
            if diagnostics.is_empty() {
                timeout
            } else {
                format!("{}\n{}", timeout, diagnostics)
            }
        } else if diagnostics.is_empty() {
            fl!("err-tool-failed", tool = self.backend.display_name())
        } else {
            diagnostics
        };
        Error::ToolFailed {
            diagnostics: message,
        }
    }
}
