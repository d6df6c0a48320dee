//! Credential Storage
//!
//! Durable persistence for exactly one token record.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::{AuthError, ConfigurationError, StorageError, StorageOp};
use crate::types::Token;

/// Directory under the home directory used by default.
pub const DEFAULT_STORAGE_DIR: &str = ".gemini";

/// Credential file name inside the storage directory.
pub const TOKEN_FILE_NAME: &str = "oauth_creds.json";

/// Credential store interface.
///
/// `load_token` reports a missing record as [`StorageError::NotFound`]; the
/// manager treats that as "not signed in yet" and every other error as a hard
/// failure.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Load the stored token.
    async fn load_token(&self) -> Result<Token, StorageError>;

    /// Store the token, replacing any previous record.
    async fn store_token(&self, token: &Token) -> Result<(), StorageError>;

    /// Remove the stored token. Removing a missing token succeeds.
    async fn clear_token(&self) -> Result<(), StorageError>;

    /// Check if a token record exists.
    async fn has_token(&self) -> bool;

    /// Where credentials live, for status reports.
    fn storage_path(&self) -> String;
}

/// In-memory credential store.
#[derive(Default)]
pub struct InMemoryCredentialStore {
    token: Mutex<Option<Token>>,
}

impl InMemoryCredentialStore {
    /// Create new in-memory credential store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store already holding `token`.
    pub fn with_token(token: Token) -> Self {
        Self {
            token: Mutex::new(Some(token)),
        }
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn load_token(&self) -> Result<Token, StorageError> {
        lock(&self.token).clone().ok_or_else(|| StorageError::NotFound {
            path: self.storage_path(),
        })
    }

    async fn store_token(&self, token: &Token) -> Result<(), StorageError> {
        *lock(&self.token) = Some(token.clone());
        Ok(())
    }

    async fn clear_token(&self) -> Result<(), StorageError> {
        *lock(&self.token) = None;
        Ok(())
    }

    async fn has_token(&self) -> bool {
        lock(&self.token).is_some()
    }

    fn storage_path(&self) -> String {
        "memory".to_string()
    }
}

/// File-backed credential store.
///
/// Writes the token as JSON to `<base_dir>/oauth_creds.json`. On Unix the
/// directory is created `0700` and the file `0600`. Writes go to a temporary
/// sibling first and are renamed into place, so readers never see a torn file.
#[derive(Debug, Clone)]
pub struct FileSystemCredentialStore {
    base_dir: PathBuf,
}

impl FileSystemCredentialStore {
    /// Create a store rooted at `base_dir`, creating the directory if needed.
    pub async fn new(base_dir: impl Into<PathBuf>) -> Result<Self, AuthError> {
        let base_dir = base_dir.into();
        ensure_dir(&base_dir).await?;
        Ok(Self { base_dir })
    }

    /// Create a store in the default directory (`~/.gemini`).
    pub async fn default_location() -> Result<Self, AuthError> {
        let base_dirs = directories::BaseDirs::new().ok_or(ConfigurationError::MissingField {
            field: "home directory",
        })?;
        Self::new(base_dirs.home_dir().join(DEFAULT_STORAGE_DIR)).await
    }

    /// Full path of the credential file.
    pub fn token_path(&self) -> PathBuf {
        self.base_dir.join(TOKEN_FILE_NAME)
    }

    fn display_path(&self) -> String {
        self.token_path().display().to_string()
    }
}

#[async_trait]
impl CredentialStore for FileSystemCredentialStore {
    async fn load_token(&self) -> Result<Token, StorageError> {
        let path = self.display_path();
        let data = tokio::fs::read(self.token_path())
            .await
            .map_err(|e| StorageError::from_io(&path, &e, StorageOp::Read))?;

        serde_json::from_slice(&data).map_err(|e| StorageError::Corrupted {
            path,
            message: e.to_string(),
        })
    }

    async fn store_token(&self, token: &Token) -> Result<(), StorageError> {
        let path = self.display_path();
        let data = serde_json::to_vec_pretty(token).map_err(|e| StorageError::WriteFailed {
            message: format!("{}: {}", path, e),
        })?;

        ensure_dir(&self.base_dir).await?;

        let tmp_path = self.base_dir.join(format!("{}.tmp", TOKEN_FILE_NAME));
        write_private(&tmp_path, &data)
            .await
            .map_err(|e| StorageError::from_io(&path, &e, StorageOp::Write))?;
        tokio::fs::rename(&tmp_path, self.token_path())
            .await
            .map_err(|e| StorageError::from_io(&path, &e, StorageOp::Write))
    }

    async fn clear_token(&self) -> Result<(), StorageError> {
        match tokio::fs::remove_file(self.token_path()).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::from_io(
                &self.display_path(),
                &e,
                StorageOp::Delete,
            )),
        }
    }

    async fn has_token(&self) -> bool {
        tokio::fs::try_exists(self.token_path())
            .await
            .unwrap_or(false)
    }

    fn storage_path(&self) -> String {
        self.base_dir.display().to_string()
    }
}

async fn ensure_dir(dir: &Path) -> Result<(), StorageError> {
    let display = dir.display().to_string();
    let mut builder = tokio::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    builder.mode(0o700);
    builder
        .create(dir)
        .await
        .map_err(|e| StorageError::from_io(&display, &e, StorageOp::Write))
}

async fn write_private(path: &Path, data: &[u8]) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;

    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(path).await?;
    file.write_all(data).await?;
    file.sync_all().await
}

/// Mock credential store for testing.
///
/// Records every call and lets tests inject failures per operation.
#[derive(Default)]
pub struct MockCredentialStore {
    token: Mutex<Option<Token>>,
    load_count: Mutex<u32>,
    store_history: Mutex<Vec<Token>>,
    clear_count: Mutex<u32>,
    next_load_error: Mutex<Option<StorageError>>,
    next_store_error: Mutex<Option<StorageError>>,
    should_fail: Mutex<bool>,
}

impl MockCredentialStore {
    /// Create new mock credential store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate the stored token.
    pub fn set_token(&self, token: Token) -> &Self {
        *lock(&self.token) = Some(token);
        self
    }

    /// Current stored token, without counting as a load.
    pub fn current_token(&self) -> Option<Token> {
        lock(&self.token).clone()
    }

    /// Fail the next load with `error`.
    pub fn set_next_load_error(&self, error: StorageError) -> &Self {
        *lock(&self.next_load_error) = Some(error);
        self
    }

    /// Fail the next store with `error`.
    pub fn set_next_store_error(&self, error: StorageError) -> &Self {
        *lock(&self.next_store_error) = Some(error);
        self
    }

    /// Fail every operation.
    pub fn set_should_fail(&self, should_fail: bool) -> &Self {
        *lock(&self.should_fail) = should_fail;
        self
    }

    /// Number of `load_token` calls.
    pub fn load_count(&self) -> u32 {
        *lock(&self.load_count)
    }

    /// Every token passed to `store_token`.
    pub fn get_store_history(&self) -> Vec<Token> {
        lock(&self.store_history).clone()
    }

    /// Number of `clear_token` calls.
    pub fn clear_count(&self) -> u32 {
        *lock(&self.clear_count)
    }

    fn check_failure(&self, op: StorageOp) -> Result<(), StorageError> {
        if *lock(&self.should_fail) {
            let message = "Mock storage failure".to_string();
            return Err(match op {
                StorageOp::Read => StorageError::ReadFailed { message },
                StorageOp::Write => StorageError::WriteFailed { message },
                StorageOp::Delete => StorageError::DeleteFailed { message },
            });
        }
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for MockCredentialStore {
    async fn load_token(&self) -> Result<Token, StorageError> {
        *lock(&self.load_count) += 1;
        self.check_failure(StorageOp::Read)?;
        if let Some(error) = lock(&self.next_load_error).take() {
            return Err(error);
        }
        lock(&self.token).clone().ok_or_else(|| StorageError::NotFound {
            path: self.storage_path(),
        })
    }

    async fn store_token(&self, token: &Token) -> Result<(), StorageError> {
        self.check_failure(StorageOp::Write)?;
        if let Some(error) = lock(&self.next_store_error).take() {
            return Err(error);
        }
        lock(&self.store_history).push(token.clone());
        *lock(&self.token) = Some(token.clone());
        Ok(())
    }

    async fn clear_token(&self) -> Result<(), StorageError> {
        *lock(&self.clear_count) += 1;
        self.check_failure(StorageOp::Delete)?;
        *lock(&self.token) = None;
        Ok(())
    }

    async fn has_token(&self) -> bool {
        lock(&self.token).is_some()
    }

    fn storage_path(&self) -> String {
        "mock".to_string()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
