//! TLS identity configuration for listener endpoints.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// Certificate material the helper loads for TLS listeners.
///
/// The paths are handed to the helper as-is; the controller only checks
/// that they exist before startup so a typo fails fast rather than on the
/// first connection.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct TlsIdentity {
    /// PEM certificate presented to switches.
    pub cert: PathBuf,
    /// PEM private key matching the certificate.
    pub privkey: PathBuf,
    /// Optional CA certificate used to verify switch certificates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cacert: Option<PathBuf>,
}

impl TlsIdentity {
    /// Builds an identity without client verification.
    #[must_use]
    pub fn new(cert: impl Into<PathBuf>, privkey: impl Into<PathBuf>) -> Self {
        Self {
            cert: cert.into(),
            privkey: privkey.into(),
            cacert: None,
        }
    }

    /// Attaches a CA certificate for verifying switch certificates.
    #[must_use]
    pub fn with_cacert(mut self, cacert: impl Into<PathBuf>) -> Self {
        self.cacert = Some(cacert.into());
        self
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        check_file("certificate", &self.cert)?;
        check_file("private key", &self.privkey)?;
        if let Some(cacert) = &self.cacert {
            check_file("CA certificate", cacert)?;
        }
        Ok(())
    }
}

fn check_file(role: &'static str, path: &Path) -> Result<(), ConfigError> {
    if path.is_file() {
        Ok(())
    } else {
        Err(ConfigError::TlsFileMissing {
            role,
            path: path.to_path_buf(),
        })
    }
}
