//! Running one test definition against one or both runners.

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use rand::seq::SliceRandom;

use crate::client::HostClient;
use crate::config::{self, Config};
use crate::error::HarnessError;
use crate::runner::{RunMode, UnknownRunMode};
use crate::with_runner::{WithRunnerOptions, with_runner_config};

/// Which runners a test runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TestMode {
    Vim,
    Nvim,
    /// One of the two, picked at random.
    Any,
    /// Both, one after the other.
    All,
}

impl TestMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Vim => "vim",
            Self::Nvim => "nvim",
            Self::Any => "any",
            Self::All => "all",
        }
    }
}

impl From<RunMode> for TestMode {
    fn from(mode: RunMode) -> Self {
        match mode {
            RunMode::Vim => Self::Vim,
            RunMode::Nvim => Self::Nvim,
        }
    }
}

impl fmt::Display for TestMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TestMode {
    type Err = UnknownRunMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "any" => Ok(Self::Any),
            "all" => Ok(Self::All),
            other => other.parse::<RunMode>().map(Self::from),
        }
    }
}

type TestBody = Arc<dyn Fn(Arc<HostClient>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// A named test body plus the runner options it needs.
#[derive(Clone)]
pub struct TestDefinition {
    pub name: String,
    pub mode: TestMode,
    pub options: WithRunnerOptions,
    body: TestBody,
}

impl fmt::Debug for TestDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestDefinition")
            .field("name", &self.name)
            .field("mode", &self.mode)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl TestDefinition {
    pub fn new<F, Fut>(mode: TestMode, name: impl Into<String>, body: F) -> Self
    where
        F: Fn(Arc<HostClient>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            mode,
            options: WithRunnerOptions::default(),
            body: Arc::new(move |host| body(host).boxed()),
        }
    }

    pub fn with_options(mut self, options: WithRunnerOptions) -> Self {
        self.options = options;
        self
    }

    /// The concrete runs this definition stands for, with their display names.
    pub fn expand(&self) -> Result<Vec<(String, RunMode)>, HarnessError> {
        if self.name.is_empty() {
            return Err(HarnessError::MissingName);
        }
        let suffixed = |mode: RunMode| (format!("{} ({mode})", self.name), mode);
        Ok(match self.mode {
            TestMode::Vim => vec![(self.name.clone(), RunMode::Vim)],
            TestMode::Nvim => vec![(self.name.clone(), RunMode::Nvim)],
            TestMode::Any => {
                let mode = RunMode::ALL
                    .choose(&mut rand::thread_rng())
                    .copied()
                    .unwrap_or(RunMode::Vim);
                vec![suffixed(mode)]
            }
            TestMode::All => RunMode::ALL.into_iter().map(suffixed).collect(),
        })
    }
}

/// Run every expansion of `def` with the process-wide config.
pub async fn run_test(def: TestDefinition) -> Result<(), HarnessError> {
    let config = config::global()?;
    run_test_config(&config, def).await
}

/// Run every expansion of `def`, stopping at the first failure.
pub async fn run_test_config(config: &Config, def: TestDefinition) -> Result<(), HarnessError> {
    for (name, mode) in def.expand()? {
        tracing::debug!(%name, %mode, "running test");
        let body = def.body.clone();
        with_runner_config(config, mode, move |host| body(host), def.options.clone())
            .await
            .map_err(|source| HarnessError::TestFailed {
                name,
                source: Box::new(source),
            })?;
    }
    Ok(())
}
