//! Bearer token lookup.
//!
//! Tokens are owned by some other authority (login, refresh, impersonation).
//! The supervisor asks for one on every connect and every poll, so rotation
//! is picked up on the next reconnect without any cache to invalidate.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use tracing::warn;

/// Something that can hand out the current bearer token.
pub trait TokenSource: Send + Sync {
    fn bearer_token(&self) -> Option<String>;
}

impl<F> TokenSource for F
where
    F: Fn() -> Option<String> + Send + Sync,
{
    fn bearer_token(&self) -> Option<String> {
        self()
    }
}

/// A token held in memory and replaceable at runtime (login, impersonation).
#[derive(Debug, Clone, Default)]
pub struct StaticToken {
    token: Arc<RwLock<Option<String>>>,
}

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: Arc::new(RwLock::new(Some(token.into()))),
        }
    }

    pub fn set(&self, token: Option<String>) {
        match self.token.write() {
            Ok(mut guard) => *guard = token,
            Err(poisoned) => *poisoned.into_inner() = token,
        }
    }
}

impl TokenSource for StaticToken {
    fn bearer_token(&self) -> Option<String> {
        match self.token.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

/// A token read from disk on every request (e.g. `<data_dir>/auth-token`).
#[derive(Debug, Clone)]
pub struct FileToken {
    path: PathBuf,
}

impl FileToken {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl TokenSource for FileToken {
    fn bearer_token(&self) -> Option<String> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => {
                let token = contents.trim();
                (!token.is_empty()).then(|| token.to_string())
            }
            Err(e) => {
                warn!(
                    component = "auth",
                    event = "auth.token_file.unreadable",
                    path = %self.path.display(),
                    error = %e,
                    "Could not read token file"
                );
                None
            }
        }
    }
}

/// Append the token as the `token` query parameter.
pub fn with_token_query(url: &str, token: Option<&str>) -> String {
    let Some(token) = token else {
        return url.to_string();
    };
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{url}{separator}token={}", urlencoding::encode(token))
}

/// `Authorization` header value.
pub fn bearer(token: &str) -> String {
    format!("Bearer {token}")
}
