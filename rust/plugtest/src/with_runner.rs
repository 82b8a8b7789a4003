//! Supervising one runner for the duration of a test body.
//!
//! ```text
//!   bind ─► spawn ─► accept ─► handshake ─► body ──┐
//!             │                                    ├─► teardown
//!             └────────── wait for exit ───────────┘
//! ```
//!
//! The body and the child's exit race. If the child exits first the run fails
//! with [`HarnessError::ProcessAborted`], whatever the body was doing. Teardown
//! (session shutdown, kill, reap) runs on every path, including a panicking body.

use std::any::Any;
use std::ffi::OsString;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use plugtest_core::{
    ADDRESS_ENV, RpcError, RpcMessage, RpcSession, SessionHooks, StreamTransport, Value,
};
use tokio_util::sync::CancellationToken;

use crate::client::HostClient;
use crate::config::{self, Config};
use crate::error::HarnessError;
use crate::listener::Listener;
use crate::runner::{self, RunMode, RunOptions, RunnerExit, RunnerHandle};
use crate::script::InitScript;

pub const DEFAULT_PLUGIN_NAME: &str = "@plugtest";
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// How long to wait for the runner to exit once its session is gone.
const ABORT_GRACE: Duration = Duration::from_secs(1);

type Session = Arc<RpcSession<StreamTransport>>;

#[derive(Debug, Clone, Default)]
pub struct WithRunnerOptions {
    /// Name the bridge plugin registers under. Defaults to [`DEFAULT_PLUGIN_NAME`].
    pub plugin_name: Option<String>,
    /// Overrides [`Config::verbose`].
    pub verbose: Option<bool>,
    /// Commands run before the bridge is loaded.
    pub prelude: Vec<String>,
    /// Commands run after the server starts.
    pub postlude: Vec<String>,
    /// Overrides [`Config::connect_timeout`].
    pub connect_timeout: Option<Duration>,
    /// Extra environment for the runner.
    pub env: Vec<(OsString, OsString)>,
}

impl WithRunnerOptions {
    pub fn plugin_name(mut self, name: impl Into<String>) -> Self {
        self.plugin_name = Some(name.into());
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = Some(verbose);
        self
    }

    pub fn prelude<I, S>(mut self, commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.prelude.extend(commands.into_iter().map(Into::into));
        self
    }

    pub fn postlude<I, S>(mut self, commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.postlude.extend(commands.into_iter().map(Into::into));
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Run `body` against a fresh runner, using the process-wide [`config::global`].
pub async fn with_runner<F, Fut>(
    mode: RunMode,
    body: F,
    options: WithRunnerOptions,
) -> Result<(), HarnessError>
where
    F: FnOnce(Arc<HostClient>) -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let config = config::global()?;
    with_runner_config(&config, mode, body, options).await
}

enum Outcome {
    Finished(Result<(), HarnessError>),
    Panicked(Box<dyn Any + Send>),
    Exited(std::io::Result<RunnerExit>),
}

/// [`with_runner`] with an explicit config.
pub async fn with_runner_config<F, Fut>(
    config: &Config,
    mode: RunMode,
    body: F,
    options: WithRunnerOptions,
) -> Result<(), HarnessError>
where
    F: FnOnce(Arc<HostClient>) -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let plugin_name = options
        .plugin_name
        .unwrap_or_else(|| DEFAULT_PLUGIN_NAME.to_owned());
    let connect_timeout = options
        .connect_timeout
        .or(config.connect_timeout)
        .unwrap_or(DEFAULT_CONNECT_TIMEOUT);

    let mut listener = Listener::bind().await.map_err(HarnessError::Listen)?;
    let commands = InitScript::new(&plugin_name, &config.host_path, &config.bridge_script)
        .prelude(options.prelude)
        .postlude(options.postlude)
        .build();
    let mut env = options.env;
    env.push((ADDRESS_ENV.into(), listener.address().to_json().into()));
    let run_options = RunOptions {
        verbose: options.verbose.unwrap_or(config.verbose),
        env,
    };
    let mut runner = runner::run(mode, &commands, &run_options, config)?;

    let cancel = CancellationToken::new();
    let mut session: Option<Session> = None;
    let outcome = {
        let perform = perform(
            &mut listener,
            &mut session,
            connect_timeout,
            &cancel,
            &plugin_name,
            body,
        );
        let watch = async {
            let exit = runner.wait_closed().await;
            cancel.cancel();
            exit
        };
        tokio::select! {
            result = perform => match result {
                Ok(Ok(result)) => Outcome::Finished(result),
                Ok(Err(payload)) => Outcome::Panicked(payload),
                Err(e) => Outcome::Finished(Err(e)),
            },
            exit = watch => Outcome::Exited(exit),
        }
    };

    // A failing body may only be seeing the fallout of the runner going away.
    let outcome = match outcome {
        Outcome::Finished(Err(e)) if session.as_ref().is_some_and(|s| s.is_closed()) => {
            match tokio::time::timeout(ABORT_GRACE, runner.wait_closed()).await {
                Ok(exit) => Outcome::Exited(exit),
                Err(_) => Outcome::Finished(Err(e)),
            }
        }
        other => other,
    };

    teardown(&mut listener, session.take(), &mut runner).await;

    match outcome {
        Outcome::Finished(result) => result,
        Outcome::Panicked(payload) => std::panic::resume_unwind(payload),
        Outcome::Exited(exit) => {
            let exit = exit.map_err(HarnessError::Wait)?;
            let err = HarnessError::ProcessAborted {
                mode,
                code: exit.status.code(),
                output: exit.output,
            };
            tracing::debug!(%err, "runner exited before the test finished");
            Err(err)
        }
    }
}

/// Accept, handshake and run the body. `Ok(Err(_))` carries a body panic.
async fn perform<F, Fut>(
    listener: &mut Listener,
    slot: &mut Option<Session>,
    connect_timeout: Duration,
    cancel: &CancellationToken,
    plugin_name: &str,
    body: F,
) -> Result<Result<Result<(), HarnessError>, Box<dyn Any + Send>>, HarnessError>
where
    F: FnOnce(Arc<HostClient>) -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let stream = listener
        .accept(connect_timeout, cancel)
        .await
        .map_err(HarnessError::ConnectionFailed)?;
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(error = %e, "set_nodelay failed");
    }

    let session = Arc::new(RpcSession::new(StreamTransport::new(stream)).with_hooks(hooks()));
    *slot = Some(session.clone());
    session.start();

    let client = HostClient::connect(session, plugin_name)
        .await
        .map_err(HarnessError::Handshake)?;
    let client = Arc::new(client);
    // let the read loop get polled once before the body's first call
    tokio::task::yield_now().await;

    let result = AssertUnwindSafe(body(client)).catch_unwind().await;
    Ok(result.map(|r| r.map_err(HarnessError::Test)))
}

fn hooks() -> SessionHooks {
    SessionHooks {
        on_invalid_message: Arc::new(|message: &Value| {
            tracing::error!(%message, "[plugtest] Unexpected message");
        }),
        on_message_error: Arc::new(|error: &RpcError, message: &RpcMessage| {
            tracing::error!(%error, ?message, "[plugtest] Failed to handle message");
        }),
    }
}

async fn teardown(listener: &mut Listener, session: Option<Session>, runner: &mut RunnerHandle) {
    listener.close();
    if let Some(session) = session {
        session.shutdown().await;
    }
    runner.close();
    if let Err(e) = runner.wait_closed().await {
        tracing::warn!(error = %e, "[plugtest] Failed to reap runner");
    }
}
