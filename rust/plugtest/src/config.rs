//! Harness configuration read from `PLUGTEST_*` environment variables.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

pub const HOST_PATH_ENV: &str = "PLUGTEST_HOST_PATH";
pub const VIM_EXECUTABLE_ENV: &str = "PLUGTEST_VIM_EXECUTABLE";
pub const NVIM_EXECUTABLE_ENV: &str = "PLUGTEST_NVIM_EXECUTABLE";
pub const BRIDGE_SCRIPT_ENV: &str = "PLUGTEST_BRIDGE_SCRIPT";
pub const VERBOSE_ENV: &str = "PLUGTEST_VERBOSE";
pub const CONNECT_TIMEOUT_ENV: &str = "PLUGTEST_CONNECT_TIMEOUT";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Environment variable '{0}' is required")]
    Missing(&'static str),
    #[error("cannot resolve '{path}'")]
    Resolve {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Absolute path to the editor-side plugin host runtime.
    pub host_path: PathBuf,
    pub vim_executable: PathBuf,
    pub nvim_executable: PathBuf,
    /// Plugin entry point the init script asks the host to load.
    pub bridge_script: PathBuf,
    /// Show editor output instead of capturing it.
    pub verbose: bool,
    /// `None` means the harness default.
    pub connect_timeout: Option<Duration>,
}

impl Config {
    /// A config with defaults for everything except the host path.
    pub fn new(host_path: impl Into<PathBuf>) -> Self {
        let host_path = host_path.into();
        Self {
            bridge_script: default_bridge_script(&host_path),
            host_path,
            vim_executable: PathBuf::from("vim"),
            nvim_executable: PathBuf::from("nvim"),
            verbose: false,
            connect_timeout: None,
        }
    }

    /// Build from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let host_path = lookup(HOST_PATH_ENV)
            .filter(|v| !v.is_empty())
            .ok_or(ConfigError::Missing(HOST_PATH_ENV))?;
        let host_path = std::path::absolute(&host_path).map_err(|source| ConfigError::Resolve {
            path: PathBuf::from(&host_path),
            source,
        })?;

        let mut config = Self::new(host_path);
        if let Some(vim) = lookup(VIM_EXECUTABLE_ENV) {
            config.vim_executable = PathBuf::from(vim);
        }
        if let Some(nvim) = lookup(NVIM_EXECUTABLE_ENV) {
            config.nvim_executable = PathBuf::from(nvim);
        }
        if let Some(script) = lookup(BRIDGE_SCRIPT_ENV) {
            config.bridge_script = PathBuf::from(script);
        }
        config.verbose = matches!(lookup(VERBOSE_ENV).as_deref(), Some("1" | "true"));
        config.connect_timeout = lookup(CONNECT_TIMEOUT_ENV)
            .as_deref()
            .and_then(parse_millis)
            .map(Duration::from_millis);
        Ok(config)
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn with_executables(mut self, vim: impl Into<PathBuf>, nvim: impl Into<PathBuf>) -> Self {
        self.vim_executable = vim.into();
        self.nvim_executable = nvim.into();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }
}

fn default_bridge_script(host_path: &Path) -> PathBuf {
    host_path.join("plugtest").join("bridge")
}

/// Leading integer part in milliseconds; `None` unless strictly positive.
fn parse_millis(raw: &str) -> Option<u64> {
    let raw = raw.trim_start();
    let (negative, digits) = match raw.as_bytes().first() {
        Some(b'-') => (true, &raw[1..]),
        Some(b'+') => (false, &raw[1..]),
        _ => (false, raw),
    };
    let end = digits
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(digits.len());
    let value: u64 = digits[..end].parse().ok()?;
    (!negative && value > 0).then_some(value)
}

static GLOBAL: Mutex<Option<Arc<Config>>> = parking_lot::const_mutex(None);

/// The process-wide config, read from the environment on first use.
pub fn global() -> Result<Arc<Config>, ConfigError> {
    let mut slot = GLOBAL.lock();
    if let Some(config) = slot.as_ref() {
        return Ok(config.clone());
    }
    let config = Arc::new(Config::from_env()?);
    *slot = Some(config.clone());
    Ok(config)
}

/// Drop the cached config, or install `config` in its place.
pub fn reset(config: Option<Config>) {
    *GLOBAL.lock() = config.map(Arc::new);
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    fn config_with(pairs: &[(&str, &str)]) -> Config {
        let mut all = vec![(HOST_PATH_ENV, "plugin-host")];
        all.extend_from_slice(pairs);
        Config::from_lookup(lookup_from(&all)).unwrap()
    }

    #[test]
    fn host_path_is_required() {
        let err = Config::from_lookup(lookup_from(&[])).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Environment variable 'PLUGTEST_HOST_PATH' is required"
        );
    }

    #[test]
    fn host_path_is_resolved_to_absolute() {
        let config = config_with(&[]);
        assert!(config.host_path.is_absolute());
        assert_eq!(config.host_path.file_name().unwrap(), "plugin-host");
        assert!(config.bridge_script.starts_with(&config.host_path));
    }

    #[test]
    fn executables_default_and_override() {
        let config = config_with(&[]);
        assert_eq!(config.vim_executable, PathBuf::from("vim"));
        assert_eq!(config.nvim_executable, PathBuf::from("nvim"));

        let config = config_with(&[(VIM_EXECUTABLE_ENV, "foo"), (NVIM_EXECUTABLE_ENV, "bar")]);
        assert_eq!(config.vim_executable, PathBuf::from("foo"));
        assert_eq!(config.nvim_executable, PathBuf::from("bar"));
    }

    #[test]
    fn verbose_accepts_only_one_or_true() {
        assert!(!config_with(&[]).verbose);
        assert!(config_with(&[(VERBOSE_ENV, "1")]).verbose);
        assert!(config_with(&[(VERBOSE_ENV, "true")]).verbose);
        for value in ["0", "false", "foo", "TRUE", ""] {
            assert!(!config_with(&[(VERBOSE_ENV, value)]).verbose, "{value}");
        }
    }

    #[test]
    fn connect_timeout_uses_leading_integer_milliseconds() {
        assert_eq!(config_with(&[]).connect_timeout, None);
        assert_eq!(
            config_with(&[(CONNECT_TIMEOUT_ENV, "123")]).connect_timeout,
            Some(Duration::from_millis(123))
        );
        assert_eq!(
            config_with(&[(CONNECT_TIMEOUT_ENV, "123.456")]).connect_timeout,
            Some(Duration::from_millis(123))
        );
        for value in ["0", "-123", "string", ""] {
            assert_eq!(
                config_with(&[(CONNECT_TIMEOUT_ENV, value)]).connect_timeout,
                None,
                "{value}"
            );
        }
    }

    #[test]
    fn reset_installs_and_clears_the_cached_config() {
        let config = Config::new("/tmp/host").with_verbose(true);
        reset(Some(config.clone()));
        assert_eq!(*global().unwrap(), config);
        reset(None);
        assert!(GLOBAL.lock().is_none());
    }
}
