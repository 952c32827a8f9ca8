use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{FtpError, Result};

/// One persisted account. `password` is either a bcrypt digest or absent
/// for anonymous-eligible accounts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserRecord {
  pub username: String,
  pub password: Option<String>,
  pub home: String,
}

/// Keyed record store over a JSON file. Loaded once at startup; `insert`
/// rewrites the file, which only the bootstrap rule and provisioning
/// tooling do. Runtime sessions only call `lookup`.
#[derive(Debug)]
pub struct UserStore {
  path: PathBuf,
  records: RwLock<HashMap<String, UserRecord>>,
}

impl UserStore {
  /// Opens the store, treating an absent file as empty.
  pub fn open(path: impl AsRef<Path>) -> Result<Self> {
    let path = path.as_ref().to_path_buf();
    let records = if path.exists() {
      let raw = fs::read_to_string(&path)?;
      let list: Vec<UserRecord> = serde_json::from_str(&raw)
        .map_err(|e| FtpError::Store(format!("malformed store '{}': {}", path.display(), e)))?;
      list.into_iter().map(|r| (r.username.clone(), r)).collect()
    } else {
      HashMap::new()
    };
    Ok(Self {
      path,
      records: RwLock::new(records),
    })
  }

  pub fn lookup(&self, username: &str) -> Option<UserRecord> {
    self.records.read().unwrap().get(username).cloned()
  }

  pub fn contains(&self, username: &str) -> bool {
    self.records.read().unwrap().contains_key(username)
  }

  /// Inserts a record and persists the whole store. An existing record for
  /// the same username is replaced.
  pub fn insert(&self, record: UserRecord) -> Result<()> {
    let mut records = self.records.write().unwrap();
    records.insert(record.username.clone(), record);
    let mut list: Vec<&UserRecord> = records.values().collect();
    list.sort_by(|a, b| a.username.cmp(&b.username));
    let raw = serde_json::to_string_pretty(&list)
      .map_err(|e| FtpError::Store(format!("cannot serialize store: {}", e)))?;
    fs::write(&self.path, raw)?;
    Ok(())
  }

  /// Seeds the anonymous account iff it is absent.
  pub fn bootstrap_anonymous(&self, root: &Path) -> Result<()> {
    if self.contains("anonymous") {
      return Ok(());
    }
    self.insert(UserRecord {
      username: "anonymous".to_string(),
      password: None,
      home: root.join("anonymous").to_string_lossy().into_owned(),
    })
  }
}

/// Credential check seam consumed by the session state machine.
#[async_trait]
pub trait Authenticator: Send + Sync {
  /// Returns the matched record on success, `InvalidCredentials` on any
  /// other outcome.
  async fn authenticate(&self, username: &str, password: &str) -> Result<UserRecord>;
}

/// Authenticates against the user store: passwordless records log in only
/// when anonymous access is enabled, everything else goes through bcrypt.
pub struct StoreAuthenticator {
  store: std::sync::Arc<UserStore>,
  allow_anonymous: bool,
}

impl StoreAuthenticator {
  pub fn new(store: std::sync::Arc<UserStore>, allow_anonymous: bool) -> Self {
    Self {
      store,
      allow_anonymous,
    }
  }
}

#[async_trait]
impl Authenticator for StoreAuthenticator {
  async fn authenticate(&self, username: &str, password: &str) -> Result<UserRecord> {
    let record = self
      .store
      .lookup(username)
      .ok_or(FtpError::InvalidCredentials)?;
    match &record.password {
      None if self.allow_anonymous => Ok(record),
      None => Err(FtpError::InvalidCredentials),
      Some(digest) => {
        // A malformed digest counts as a failed check, not a server fault.
        if bcrypt::verify(password, digest).unwrap_or(false) {
          Ok(record)
        } else {
          Err(FtpError::InvalidCredentials)
        }
      }
    }
  }
}
