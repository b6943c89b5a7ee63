//! Bearer token authentication for avatar clients
//!
//! Clients present a shared token in their first packet. The token is
//! compared in constant time and never appears in logs or `Debug` output.
//!
//! When no token is configured the daemon generates one and stores it in
//! `$XDG_RUNTIME_DIR/avatar-bridge/bridge.token` (mode 0600) for the client
//! to pick up.

use std::fmt;
use std::path::{Path, PathBuf};

use rand::RngCore;
use thiserror::Error;

/// Random bytes in a generated token
pub const TOKEN_SIZE: usize = 32;

/// Token file name within the runtime directory
pub const TOKEN_FILENAME: &str = "bridge.token";

/// Runtime directory name
pub const RUNTIME_DIR_NAME: &str = "avatar-bridge";

/// Errors related to token files
#[derive(Debug, Error)]
pub enum TokenError {
    /// Token file could not be written
    #[error("failed to write token file {path}: {source}")]
    WriteFailed {
        /// Target path
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// Token file could not be read
    #[error("failed to read token file {path}: {source}")]
    ReadFailed {
        /// Source path
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// Token file or configured token is empty
    #[error("token is empty")]
    Empty,
}

/// Shared secret clients must present
#[derive(Clone)]
pub struct AuthToken {
    secret: String,
}

impl AuthToken {
    /// Wrap a configured secret
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::Empty`] for an empty or whitespace secret.
    pub fn new(secret: impl Into<String>) -> Result<Self, TokenError> {
        let secret = secret.into().trim().to_string();
        if secret.is_empty() {
            return Err(TokenError::Empty);
        }
        Ok(Self { secret })
    }

    /// Generate a random hex token
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; TOKEN_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self {
            secret: hex::encode(bytes),
        }
    }

    /// Check a presented token in constant time
    #[must_use]
    pub fn verify(&self, provided: &str) -> bool {
        constant_time_eq(self.secret.as_bytes(), provided.as_bytes())
    }

    /// The raw secret, for writing the token file or building resource URLs
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.secret
    }

    /// Write the token with owner-only permissions
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::WriteFailed`] if the directory or file cannot be
    /// created.
    pub async fn write_to_file(&self, path: &Path) -> Result<(), TokenError> {
        let write_err = |source| TokenError::WriteFailed {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                tokio::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700))
                    .await
                    .map_err(write_err)?;
            }
        }

        tokio::fs::write(path, format!("{}\n", self.secret))
            .await
            .map_err(write_err)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
                .await
                .map_err(write_err)?;
        }

        tracing::debug!(path = %path.display(), "Bridge token written to file");
        Ok(())
    }

    /// Read a token previously written with [`AuthToken::write_to_file`]
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is empty.
    pub async fn read_from_file(path: &Path) -> Result<Self, TokenError> {
        let contents =
            tokio::fs::read_to_string(path)
                .await
                .map_err(|source| TokenError::ReadFailed {
                    path: path.to_path_buf(),
                    source,
                })?;
        Self::new(contents)
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AuthToken([REDACTED])")
    }
}

/// Default token file path
///
/// `$XDG_RUNTIME_DIR/avatar-bridge/bridge.token`, falling back to the system
/// temp directory when no runtime directory exists.
#[must_use]
pub fn default_token_path() -> PathBuf {
    dirs::runtime_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(RUNTIME_DIR_NAME)
        .join(TOKEN_FILENAME)
}

/// Compare two byte strings without early exit
///
/// Runs over the longer input so timing depends only on lengths.
#[must_use]
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    let mut diff = a.len() ^ b.len();
    for i in 0..a.len().max(b.len()) {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        diff |= usize::from(x ^ y);
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_verify() {
        let token = AuthToken::new("abc123").unwrap();
        assert!(token.verify("abc123"));
        assert!(!token.verify("abc124"));
        assert!(!token.verify("abc1234"));
        assert!(!token.verify(""));
    }

    #[test]
    fn test_new_trims_and_rejects_empty() {
        assert!(AuthToken::new("  secret \n").unwrap().verify("secret"));
        assert!(matches!(AuthToken::new("   "), Err(TokenError::Empty)));
    }

    #[test]
    fn test_generated_tokens_differ() {
        let a = AuthToken::generate();
        let b = AuthToken::generate();
        assert_eq!(a.expose().len(), TOKEN_SIZE * 2);
        assert!(!a.verify(b.expose()));
    }

    #[test]
    fn test_debug_redacts_secret() {
        let token = AuthToken::new("hunter2").unwrap();
        let debug = format!("{token:?}");
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("REDACTED"));
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"", b""));
        assert!(constant_time_eq(b"same", b"same"));
        assert!(!constant_time_eq(b"same", b"samf"));
        assert!(!constant_time_eq(b"short", b"shorter"));
        assert!(!constant_time_eq(b"a\0", b"a"));
    }

    #[tokio::test]
    async fn test_file_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join(TOKEN_FILENAME);

        let token = AuthToken::generate();
        token.write_to_file(&path).await.unwrap();

        let read = AuthToken::read_from_file(&path).await.unwrap();
        assert!(read.verify(token.expose()));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[tokio::test]
    async fn test_read_missing_file() {
        let dir = TempDir::new().unwrap();
        let result = AuthToken::read_from_file(&dir.path().join("missing")).await;
        assert!(matches!(result, Err(TokenError::ReadFailed { .. })));
    }
}
