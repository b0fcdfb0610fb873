//! The supported tool families and their command lines.
//!
//! Everything variant-specific lives here: the launcher and the exchange
//! loop never branch on the backend. Adding a fourth tool family means
//! adding arms to these matches, not touching the I/O machinery.

use std::ffi::OsString;
use std::os::fd::RawFd;

use crate::error::Error;

/// The environment variable through which PGP 5 and PGP 2.x accept the
/// number of a descriptor to read the passphrase from. It is only ever set
/// on the child's environment, never the parent's.
const PASSPHRASE_FD_VAR: &str = "PGPPASSFD";

/// The family of OpenPGP tool being driven.
///
/// The families differ in their command-line dialects and in how they
/// accept a passphrase descriptor (an explicit argument for GnuPG, the
/// `PGPPASSFD` environment variable for the PGP lineages); they share the
/// pipe and process handling.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backend {
    /// GnuPG (`gpg`).
    GnuPg,
    /// PGP 5 (`pgpv`/`pgpe`/`pgps`, one binary dispatching on its name).
    Pgp5,
    /// PGP 2.x (`pgp`).
    Pgp2,
}

impl Backend {
    /// The name shown to the user in passphrase prompts.
    pub(crate) fn display_name(self) -> &'static str {
        match self {
            Backend::GnuPg => "GnuPG",
            Backend::Pgp5 => "PGP5",
            Backend::Pgp2 => "PGP2.x",
        }
    }

    /// Whether the tool can be told which digest to use for a detached
    /// signature. Only GnuPG can; for the PGP lineages the request is
    /// refused rather than silently dropped.
    pub fn supports_digest_selection(self) -> bool {
        matches!(self, Backend::GnuPg)
    }

    /// Builds the command line for `op`.
    ///
    /// `passphrase_fd` is the number of the descriptor the tool should read
    /// the passphrase from, already inheritable by the child; `None` when
    /// the operation needs no passphrase. The raw passphrase itself never
    /// enters the argument vector or the environment.
    pub(crate) fn command_line(
        self,
        op: &Operation<'_>,
        passphrase_fd: Option<RawFd>,
    ) -> Result<CommandLine, Error> {
        let mut line = CommandLine::new();

        match (self, op) {
            (Backend::GnuPg, Operation::Decrypt) => {
                line.args(&["--verbose", "--yes", "--batch"]);
                line.args(&["--output", "-", "--decrypt"]);
                line.passphrase_fd_arg(passphrase_fd);
            }
            (Backend::GnuPg, Operation::Encrypt { recipients, signer }) => {
                line.args(&["--verbose", "--yes", "--batch", "--armor"]);
                for recipient in recipients.iter() {
                    line.args(&["-r"]);
                    line.arg(recipient);
                }
                line.args(&["--output", "-", "--encrypt"]);
                if let Some(signer) = signer {
                    line.args(&["--sign", "-u"]);
                    line.arg(signer);
                    line.passphrase_fd_arg(passphrase_fd);
                }
            }
            (Backend::GnuPg, Operation::Clearsign { signer }) => {
                line.args(&["--clearsign"]);
                if let Some(signer) = signer {
                    line.args(&["-u"]);
                    line.arg(signer);
                }
                line.args(&["--verbose", "--yes", "--batch", "--armor"]);
                line.args(&["--output", "-"]);
                line.passphrase_fd_arg(passphrase_fd);
            }
            (Backend::GnuPg, Operation::DetachedSign { signer, hash }) => {
                line.args(&["--clearsign", "-b"]);
                line.args(&["--digest-algo", hash.digest_name()]);
                if let Some(signer) = signer {
                    line.args(&["-u"]);
                    line.arg(signer);
                }
                line.args(&["--verbose", "--yes", "--batch", "--armor"]);
                line.args(&["--output", "-"]);
                line.passphrase_fd_arg(passphrase_fd);
            }

            (Backend::Pgp5, Operation::Decrypt) => {
                line.arg0 = Some("pgpv");
                line.args(&["-f", "+batchmode=1"]);
                line.passphrase_fd_env(passphrase_fd);
            }
            (Backend::Pgp5, Operation::Encrypt { recipients, signer }) => {
                line.arg0 = Some("pgpe");
                for recipient in recipients.iter() {
                    line.args(&["-r"]);
                    line.arg(recipient);
                }
                line.args(&["-f", "-z", "-a", "-o", "-"]);
                if let Some(signer) = signer {
                    line.args(&["-s", "-u"]);
                    line.arg(signer);
                    line.passphrase_fd_env(passphrase_fd);
                }
            }
            (Backend::Pgp5, Operation::Clearsign { signer }) => {
                line.arg0 = Some("pgps");
                if let Some(signer) = signer {
                    line.args(&["-u"]);
                    line.arg(signer);
                }
                line.args(&["-f", "-z", "-a", "-o", "-", "-s"]);
                line.passphrase_fd_env(passphrase_fd);
            }

            (Backend::Pgp2, Operation::Decrypt) => {
                line.args(&["-f"]);
                line.passphrase_fd_env(passphrase_fd);
            }
            (Backend::Pgp2, Operation::Encrypt { recipients, signer }) => {
                line.args(&["-f", "-e", "-a", "-o", "-"]);
                for recipient in recipients.iter() {
                    line.arg(recipient);
                }
                if let Some(signer) = signer {
                    line.args(&["-s", "-u"]);
                    line.arg(signer);
                    line.passphrase_fd_env(passphrase_fd);
                }
            }
            (Backend::Pgp2, Operation::Clearsign { signer }) => {
                if let Some(signer) = signer {
                    line.args(&["-u"]);
                    line.arg(signer);
                }
                line.args(&["-f", "-a", "-o", "-", "-s"]);
                line.passphrase_fd_env(passphrase_fd);
            }

            (Backend::Pgp5, Operation::DetachedSign { hash, .. })
            | (Backend::Pgp2, Operation::DetachedSign { hash, .. }) => {
                return Err(Error::HashNotSupported {
                    backend: self,
                    hash: *hash,
                });
            }
        }

        Ok(line)
    }
}

/// The digest used for a detached signature.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HashAlgorithm {
    /// MD5, kept for interoperability with old keys.
    Md5,
    /// SHA-1.
    Sha1,
}

impl HashAlgorithm {
    pub(crate) fn digest_name(self) -> &'static str {
        match self {
            HashAlgorithm::Md5 => "MD5",
            HashAlgorithm::Sha1 => "SHA1",
        }
    }
}

/// One caller-facing operation, with its parameters.
pub(crate) enum Operation<'a> {
    Decrypt,
    Encrypt {
        recipients: &'a [String],
        signer: Option<&'a str>,
    },
    Clearsign {
        signer: Option<&'a str>,
    },
    DetachedSign {
        signer: Option<&'a str>,
        hash: HashAlgorithm,
    },
}

impl Operation<'_> {
    /// Whether the operation needs the user's passphrase. Decryption and
    /// every signing operation do; encrypting without signing does not.
    pub(crate) fn needs_passphrase(&self) -> bool {
        !matches!(self, Operation::Encrypt { signer: None, .. })
    }
}

/// A built command line: the argv-0 override (for tools that dispatch on
/// their own name), the argument vector, and the variables to set on the
/// child's environment.
pub(crate) struct CommandLine {
    pub(crate) arg0: Option<&'static str>,
    pub(crate) args: Vec<OsString>,
    pub(crate) env: Vec<(&'static str, String)>,
}

impl CommandLine {
    fn new() -> Self {
        CommandLine {
            arg0: None,
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    fn arg(&mut self, arg: &str) {
        self.args.push(OsString::from(arg));
    }

    fn args(&mut self, args: &[&str]) {
        self.args.extend(args.iter().map(OsString::from));
    }

    fn passphrase_fd_arg(&mut self, fd: Option<RawFd>) {
        if let Some(fd) = fd {
            self.args(&["--passphrase-fd"]);
            self.args.push(fd.to_string().into());
        }
    }

    fn passphrase_fd_env(&mut self, fd: Option<RawFd>) {
        if let Some(fd) = fd {
            self.env.push((PASSPHRASE_FD_VAR, fd.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Backend, CommandLine, HashAlgorithm, Operation};
    use crate::error::Error;

    fn flat(line: &CommandLine) -> Vec<&str> {
        line.args.iter().map(|a| a.to_str().unwrap()).collect()
    }

    #[test]
    fn gnupg_decrypt() {
        let line = Backend::GnuPg
            .command_line(&Operation::Decrypt, Some(7))
            .unwrap();
        assert_eq!(line.arg0, None);
        assert_eq!(
            flat(&line),
            [
                "--verbose",
                "--yes",
                "--batch",
                "--output",
                "-",
                "--decrypt",
                "--passphrase-fd",
                "7",
            ]
        );
        assert!(line.env.is_empty());
    }

    #[test]
    fn gnupg_encrypt_builds_one_flag_per_recipient() {
        let recipients = vec!["alice@example.org".to_string(), "bob@example.org".to_string()];
        let line = Backend::GnuPg
            .command_line(
                &Operation::Encrypt {
                    recipients: &recipients,
                    signer: None,
                },
                None,
            )
            .unwrap();
        let args = flat(&line);
        assert_eq!(
            args.iter().filter(|a| **a == "-r").count(),
            recipients.len()
        );
        assert!(args.contains(&"alice@example.org"));
        assert!(args.contains(&"bob@example.org"));
        // Unsigned encryption carries no passphrase delivery at all.
        assert!(!args.contains(&"--passphrase-fd"));
        assert!(line.env.is_empty());
    }

    #[test]
    fn gnupg_signed_encrypt_delivers_passphrase_by_argument() {
        let recipients = vec!["alice@example.org".to_string()];
        let line = Backend::GnuPg
            .command_line(
                &Operation::Encrypt {
                    recipients: &recipients,
                    signer: Some("carol"),
                },
                Some(9),
            )
            .unwrap();
        let args = flat(&line);
        assert!(args.contains(&"--sign"));
        assert!(args.contains(&"carol"));
        assert!(args.contains(&"--passphrase-fd"));
        assert!(args.contains(&"9"));
        assert!(line.env.is_empty());
    }

    #[test]
    fn gnupg_detached_signature_selects_digest() {
        let line = Backend::GnuPg
            .command_line(
                &Operation::DetachedSign {
                    signer: Some("carol"),
                    hash: HashAlgorithm::Sha1,
                },
                Some(5),
            )
            .unwrap();
        let args = flat(&line);
        assert!(args.contains(&"-b"));
        let digest = args.iter().position(|a| *a == "--digest-algo").unwrap();
        assert_eq!(args[digest + 1], "SHA1");
    }

    #[test]
    fn pgp5_dispatches_on_argv0_and_environment() {
        let line = Backend::Pgp5
            .command_line(&Operation::Decrypt, Some(7))
            .unwrap();
        assert_eq!(line.arg0, Some("pgpv"));
        assert_eq!(flat(&line), ["-f", "+batchmode=1"]);
        assert_eq!(line.env, [("PGPPASSFD", "7".to_string())]);

        let line = Backend::Pgp5
            .command_line(&Operation::Clearsign { signer: None }, Some(3))
            .unwrap();
        assert_eq!(line.arg0, Some("pgps"));
        assert_eq!(line.env, [("PGPPASSFD", "3".to_string())]);
    }

    #[test]
    fn pgp5_unsigned_encrypt_sets_no_environment() {
        let recipients = vec!["alice".to_string()];
        let line = Backend::Pgp5
            .command_line(
                &Operation::Encrypt {
                    recipients: &recipients,
                    signer: None,
                },
                None,
            )
            .unwrap();
        assert_eq!(line.arg0, Some("pgpe"));
        assert!(line.env.is_empty());
    }

    #[test]
    fn pgp2_takes_bare_recipients() {
        let recipients = vec!["alice".to_string(), "bob".to_string()];
        let line = Backend::Pgp2
            .command_line(
                &Operation::Encrypt {
                    recipients: &recipients,
                    signer: Some("carol"),
                },
                Some(8),
            )
            .unwrap();
        let args = flat(&line);
        assert!(!args.contains(&"-r"));
        assert!(args.contains(&"alice"));
        assert!(args.contains(&"bob"));
        assert_eq!(line.env, [("PGPPASSFD", "8".to_string())]);
    }

    #[test]
    fn pgp_lineages_refuse_digest_selection() {
        for backend in [Backend::Pgp5, Backend::Pgp2] {
            let result = backend.command_line(
                &Operation::DetachedSign {
                    signer: None,
                    hash: HashAlgorithm::Md5,
                },
                Some(4),
            );
            assert!(matches!(result, Err(Error::HashNotSupported { .. })));
        }
    }

    #[test]
    fn only_signing_free_encryption_skips_the_passphrase() {
        let recipients = vec!["alice".to_string()];
        assert!(Operation::Decrypt.needs_passphrase());
        assert!(Operation::Clearsign { signer: None }.needs_passphrase());
        assert!(Operation::DetachedSign {
            signer: None,
            hash: HashAlgorithm::Sha1
        }
        .needs_passphrase());
        assert!(Operation::Encrypt {
            recipients: &recipients,
            signer: Some("carol")
        }
        .needs_passphrase());
        assert!(!Operation::Encrypt {
            recipients: &recipients,
            signer: None
        }
        .needs_passphrase());
    }
}
