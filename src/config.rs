//! Client configuration.
//!
//! [`ClientConfig`] holds the resolved settings every component reads.  [`SearchArgs`] is the
//! command-line surface of the `semki-search` binary, parsed with `arrrg`.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use arrrg_derive::CommandLine;
use url::Url;

use crate::error::{Error, Result};
use crate::types::SearchFilters;

const DEFAULT_BASE_URL: &str = "http://localhost:8080/";
const DEFAULT_API_PREFIX: &str = "api/v1/";
const DEFAULT_LOGIN_PATH: &str = "/login";
const DEFAULT_STORAGE_NAMESPACE: &str = "auth-storage";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_RESULT_LIMIT: u32 = 10;

/// Environment variable overriding the API origin.
pub const API_URL_ENV: &str = "SEMKI_API_URL";
/// Environment variable overriding where credentials are persisted.
pub const STATE_DIR_ENV: &str = "SEMKI_STATE_DIR";

/// Resolved client settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// API origin, e.g. `https://acme.semki.example/`.
    pub base_url: String,
    /// Prefix under which every endpoint lives.
    pub api_prefix: String,
    /// UI location of the login entry point.
    pub login_path: String,
    /// Key under which credentials are persisted.
    pub storage_namespace: String,
    /// Directory holding the persisted credential file.
    pub storage_dir: PathBuf,
    /// Per-call timeout for buffered calls, and the connect timeout for streams.
    pub timeout: Duration,
    /// Result cap sent with searches that do not set their own.
    pub result_limit: u32,
}

impl ClientConfig {
    /// Creates a new ClientConfig with default values.
    ///
    /// Defaults:
    /// - API: http://localhost:8080/api/v1/
    /// - Login entry point: /login
    /// - Credentials: `<tmp>/semki/auth-storage.json`
    /// - Timeout: 60 seconds
    /// - Result limit: 10
    pub fn new() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_prefix: DEFAULT_API_PREFIX.to_string(),
            login_path: DEFAULT_LOGIN_PATH.to_string(),
            storage_namespace: DEFAULT_STORAGE_NAMESPACE.to_string(),
            storage_dir: env::temp_dir().join("semki"),
            timeout: DEFAULT_TIMEOUT,
            result_limit: DEFAULT_RESULT_LIMIT,
        }
    }

    /// Defaults, overridden by `SEMKI_API_URL` and `SEMKI_STATE_DIR` when set.
    pub fn from_env() -> Self {
        let mut config = Self::new();
        if let Ok(url) = env::var(API_URL_ENV)
            && !url.trim().is_empty()
        {
            config.base_url = url;
        }
        if let Ok(dir) = env::var(STATE_DIR_ENV)
            && !dir.trim().is_empty()
        {
            config.storage_dir = PathBuf::from(dir);
        }
        config
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_api_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.api_prefix = prefix.into();
        self
    }

    pub fn with_login_path(mut self, path: impl Into<String>) -> Self {
        self.login_path = path.into();
        self
    }

    pub fn with_storage_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.storage_namespace = namespace.into();
        self
    }

    pub fn with_storage_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.storage_dir = dir.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_result_limit(mut self, limit: u32) -> Self {
        self.result_limit = limit;
        self
    }

    /// The absolute URL every endpoint path is joined onto.
    pub fn api_root(&self) -> Result<Url> {
        let mut base = self.base_url.trim().to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let mut prefix = self.api_prefix.trim_start_matches('/').to_string();
        if !prefix.is_empty() && !prefix.ends_with('/') {
            prefix.push('/');
        }
        let base = Url::parse(&base)?;
        if base.cannot_be_a_base() {
            return Err(Error::url(
                format!("{} cannot be used as an API origin", self.base_url),
                None,
            ));
        }
        Ok(base.join(&prefix)?)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Command-line arguments for the semki-search tool.
#[derive(CommandLine, Debug, Default, PartialEq, Eq)]
pub struct SearchArgs {
    #[arrrg(optional, "API origin (default: $SEMKI_API_URL or http://localhost:8080/)", "URL")]
    pub api_url: Option<String>,

    #[arrrg(optional, "Email to log in with when no credential is stored", "EMAIL")]
    pub email: Option<String>,

    #[arrrg(optional, "Password to log in with", "PASSWORD")]
    pub password: Option<String>,

    #[arrrg(optional, "Organization to log in to", "ORG")]
    pub organization: Option<String>,

    #[arrrg(optional, "Comma-separated team ids", "TEAMS")]
    pub teams: Option<String>,

    #[arrrg(optional, "Comma-separated level ids", "LEVELS")]
    pub levels: Option<String>,

    #[arrrg(optional, "Comma-separated locations", "LOCATIONS")]
    pub locations: Option<String>,

    #[arrrg(optional, "Maximum number of results (default: 10)", "N")]
    pub limit: Option<u32>,

    /// Replay a persisted chat instead of searching.
    #[arrrg(optional, "Replay the stored results of a chat", "CHAT_ID")]
    pub chat: Option<String>,

    #[arrrg(flag, "List past chats")]
    pub history: bool,

    #[arrrg(flag, "Log out and forget the stored credential")]
    pub logout: bool,
}

impl SearchArgs {
    /// The client configuration these arguments select.
    pub fn client_config(&self) -> ClientConfig {
        let config = ClientConfig::from_env();
        match &self.api_url {
            Some(url) => config.with_base_url(url.clone()),
            None => config,
        }
    }

    /// The filter set these arguments select, with `default_limit` filling in a missing limit.
    pub fn filters(&self, default_limit: u32) -> SearchFilters {
        fn split(list: &Option<String>) -> Vec<String> {
            list.as_deref()
                .unwrap_or_default()
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        }
        SearchFilters::new()
            .with_teams(split(&self.teams))
            .with_levels(split(&self.levels))
            .with_locations(split(&self.locations))
            .with_limit(self.limit.unwrap_or(default_limit))
    }
}
