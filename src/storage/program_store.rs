//! Content-addressed storage for uploaded program images.
//!
//! A program is addressed by the SHA3-256 of its bytes, rendered as 64 lowercase hex
//! characters. The store keeps an explicit token to path index: a token is only ever
//! served if it was produced by an upload (or re-indexed from a file whose contents
//! still hash to its name), and an upload whose token already maps to different bytes
//! is rejected as a collision instead of silently replacing the stored file.

use crate::types::hash::Hash;
use crate::virtual_machine::errors::HostLimitExceeded;
use crate::{debug, info, warn};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// Uploads must be strictly smaller than this many bytes.
pub const MAX_UPLOAD: usize = 4096;

/// File extension of stored images.
pub const IMAGE_EXTENSION: &str = "xvm";

/// Identifier handed out for an uploaded program.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Token(Hash);

impl Token {
    /// Token of `bytes`.
    pub fn for_bytes(bytes: &[u8]) -> Token {
        Token(Hash::digest(bytes))
    }

    pub fn hash(&self) -> Hash {
        self.0
    }

    /// `<token>.xvm`
    pub fn file_name(&self) -> String {
        format!("{}.{}", self, IMAGE_EXTENSION)
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for Token {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Hash::from_hex(s.trim())
            .map(Token)
            .ok_or(StoreError::InvalidToken)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Limit(#[from] HostLimitExceeded),
    #[error("malformed token")]
    InvalidToken,
    #[error("unknown token {token}")]
    UnknownToken { token: Token },
    #[error("token {token} already maps to different contents")]
    Collision { token: Token },
    #[error("stored program {token} no longer matches its token")]
    Corrupt { token: Token },
    #[error("store i/o failed: {0}")]
    Io(#[from] io::Error),
}

/// Storage backend for program images.
///
/// Implementations must be thread-safe so concurrent sessions can share one store.
pub trait ProgramStore: Send + Sync {
    /// Stores `bytes` and returns their token. Re-uploading identical bytes returns the
    /// same token.
    fn upload(&self, bytes: &[u8]) -> Result<Token, StoreError>;

    /// Returns the bytes stored under `token`.
    fn get(&self, token: &Token) -> Result<Vec<u8>, StoreError>;

    fn contains(&self, token: &Token) -> bool;

    /// Number of stored programs.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Rejects uploads at or above [`MAX_UPLOAD`].
pub fn check_upload_size(size: usize) -> Result<(), HostLimitExceeded> {
    if size >= MAX_UPLOAD {
        return Err(HostLimitExceeded::UploadTooLarge {
            size,
            limit: MAX_UPLOAD,
        });
    }
    Ok(())
}

/// In-memory store for tests and ephemeral services.
#[derive(Default)]
pub struct MemoryProgramStore {
    programs: DashMap<Token, Arc<[u8]>>,
}

impl MemoryProgramStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProgramStore for MemoryProgramStore {
    fn upload(&self, bytes: &[u8]) -> Result<Token, StoreError> {
        check_upload_size(bytes.len())?;
        let token = Token::for_bytes(bytes);
        match self.programs.entry(token) {
            Entry::Occupied(existing) if existing.get().as_ref() != bytes => {
                Err(StoreError::Collision { token })
            }
            Entry::Occupied(_) => Ok(token),
            Entry::Vacant(slot) => {
                slot.insert(Arc::from(bytes));
                Ok(token)
            }
        }
    }

    fn get(&self, token: &Token) -> Result<Vec<u8>, StoreError> {
        self.programs
            .get(token)
            .map(|bytes| bytes.to_vec())
            .ok_or(StoreError::UnknownToken { token: *token })
    }

    fn contains(&self, token: &Token) -> bool {
        self.programs.contains_key(token)
    }

    fn len(&self) -> usize {
        self.programs.len()
    }
}

/// Directory-backed store. Each program lives in `<dir>/<token>.xvm`.
pub struct FsProgramStore {
    dir: PathBuf,
    index: DashMap<Token, PathBuf>,
    next_temp: AtomicU64,
}

impl FsProgramStore {
    /// Opens (creating if needed) a store rooted at `dir` and indexes the programs
    /// already there.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        restrict_dir(&dir)?;
        let store = Self {
            dir,
            index: DashMap::new(),
            next_temp: AtomicU64::new(0),
        };
        store.reindex()?;
        info!(
            "program store at {} holds {} program(s)",
            store.dir.display(),
            store.index.len()
        );
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn reindex(&self) -> Result<(), StoreError> {
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let Some(token) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_suffix(".xvm"))
                .and_then(|stem| stem.parse::<Token>().ok())
            else {
                continue;
            };
            match fs::read(&path) {
                Ok(bytes) if bytes.len() < MAX_UPLOAD && Token::for_bytes(&bytes) == token => {
                    self.index.insert(token, path);
                }
                Ok(_) => warn!("skipping {}: contents do not match its name", path.display()),
                Err(e) => warn!("skipping {}: {e}", path.display()),
            }
        }
        Ok(())
    }

    /// Writes `bytes` to a private temporary file and renames it into place.
    fn write_atomically(&self, token: &Token, bytes: &[u8]) -> Result<PathBuf, StoreError> {
        let final_path = self.dir.join(token.file_name());
        let temp_path = self.dir.join(format!(
            ".{}.{}.{}.tmp",
            token,
            std::process::id(),
            self.next_temp.fetch_add(1, Ordering::Relaxed)
        ));
        let result = (|| -> io::Result<()> {
            let mut file = private_file(&temp_path)?;
            file.write_all(bytes)?;
            file.sync_all()?;
            fs::rename(&temp_path, &final_path)
        })();
        if let Err(e) = result {
            let _ = fs::remove_file(&temp_path);
            return Err(e.into());
        }
        Ok(final_path)
    }
}

impl ProgramStore for FsProgramStore {
    fn upload(&self, bytes: &[u8]) -> Result<Token, StoreError> {
        check_upload_size(bytes.len())?;
        let token = Token::for_bytes(bytes);
        if let Some(path) = self.index.get(&token).map(|p| p.clone()) {
            return if fs::read(&path)? == bytes {
                debug!("upload of existing program {token}");
                Ok(token)
            } else {
                Err(StoreError::Collision { token })
            };
        }
        let path = self.write_atomically(&token, bytes)?;
        self.index.insert(token, path);
        info!("stored program {token} ({} bytes)", bytes.len());
        Ok(token)
    }

    fn get(&self, token: &Token) -> Result<Vec<u8>, StoreError> {
        let path = self
            .index
            .get(token)
            .map(|p| p.clone())
            .ok_or(StoreError::UnknownToken { token: *token })?;
        let bytes = fs::read(path)?;
        if Token::for_bytes(&bytes) != *token {
            return Err(StoreError::Corrupt { token: *token });
        }
        Ok(bytes)
    }

    fn contains(&self, token: &Token) -> bool {
        self.index.contains_key(token)
    }

    fn len(&self) -> usize {
        self.index.len()
    }
}

#[cfg(unix)]
fn private_file(path: &Path) -> io::Result<fs::File> {
    use std::os::unix::fs::OpenOptionsExt;
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn private_file(path: &Path) -> io::Result<fs::File> {
    OpenOptions::new().write(true).create_new(true).open(path)
}

#[cfg(unix)]
fn restrict_dir(dir: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(dir, fs::Permissions::from_mode(0o700))
}

#[cfg(not(unix))]
fn restrict_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}
