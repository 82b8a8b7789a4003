#![forbid(unsafe_code)]
//! Integration-test harness for editor plugins.
//!
//! [`with_runner`] spawns vim or neovim, waits for the bridge plugin inside it
//! to dial back, and hands the test body a [`HostClient`] speaking msgpack-rpc
//! to the editor. If the editor dies mid-test the run fails with its captured
//! output.
//!
//! ```ignore
//! use plugtest::{Host, RunMode, WithRunnerOptions, with_runner};
//!
//! with_runner(RunMode::Nvim, |host| async move {
//!     let has = host.call("has", vec!["nvim".into()]).await?;
//!     assert_eq!(has, 1.into());
//!     Ok(())
//! }, WithRunnerOptions::default()).await?;
//! ```

pub mod config;
mod client;
mod error;
mod listener;
pub mod runner;
mod script;
pub mod stub;
pub mod tester;
mod with_runner;

pub use client::HostClient;
pub use config::{Config, ConfigError};
pub use error::HarnessError;
pub use listener::{ConnectError, Listener};
pub use runner::{RunMode, RunOptions, RunnerExit, RunnerHandle};
pub use script::InitScript;
pub use stub::HostStub;
pub use tester::{TestDefinition, TestMode, run_test, run_test_config};
pub use with_runner::*;

pub use plugtest_core::{
    BatchCall, Context, DispatchTable, Host, HostKind, HostMode, Meta, Platform, RemoteError,
    RpcError, Value,
};
