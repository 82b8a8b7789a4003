use std::path::PathBuf;

use plugtest_core::RpcError;

use crate::config::ConfigError;
use crate::listener::ConnectError;
use crate::runner::RunMode;

/// Everything [`with_runner`](crate::with_runner) can fail with.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("[plugtest] Failed to spawn {mode} runner '{}'", .program.display())]
    Spawn {
        mode: RunMode,
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[plugtest] Failed to bind listener")]
    Listen(#[source] std::io::Error),

    #[error("[plugtest] Connection failed.")]
    ConnectionFailed(#[source] ConnectError),

    /// The runner exited before the test body finished.
    #[error(
        "[plugtest] Process aborted ({mode}, code={status}){suffix}",
        status = exit_code(.code),
        suffix = output_suffix(.output)
    )]
    ProcessAborted {
        mode: RunMode,
        code: Option<i32>,
        output: Option<String>,
    },

    #[error("[plugtest] Handshake failed")]
    Handshake(#[source] RpcError),

    #[error("[plugtest] Failed to wait for the runner")]
    Wait(#[source] std::io::Error),

    #[error("test name is required")]
    MissingName,

    /// A fanned-out test failed; `name` carries the runner suffix.
    #[error("test '{name}' failed: {source}")]
    TestFailed {
        name: String,
        #[source]
        source: Box<HarnessError>,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The test body returned an error.
    #[error(transparent)]
    Test(#[from] anyhow::Error),
}

fn exit_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "signal".to_string(),
    }
}

fn output_suffix(output: &Option<String>) -> String {
    match output {
        Some(output) if !output.is_empty() => {
            format!(":\n------- output -------\n{output}\n----- output end -----")
        }
        _ => ".".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_aborted_embeds_output() {
        let err = HarnessError::ProcessAborted {
            mode: RunMode::Vim,
            code: Some(1),
            output: Some("foobar".into()),
        };
        assert_eq!(
            err.to_string(),
            "[plugtest] Process aborted (vim, code=1):\n------- output -------\nfoobar\n----- output end -----"
        );
    }

    #[test]
    fn process_aborted_without_output_ends_with_period() {
        let err = HarnessError::ProcessAborted {
            mode: RunMode::Nvim,
            code: None,
            output: Some(String::new()),
        };
        assert_eq!(
            err.to_string(),
            "[plugtest] Process aborted (nvim, code=signal)."
        );
    }

    #[test]
    fn handshake_failure_keeps_the_rpc_error_as_source() {
        use std::error::Error as _;

        let err = HarnessError::Handshake(RpcError::SessionClosed);
        assert_eq!(err.to_string(), "[plugtest] Handshake failed");
        let source = err.source().expect("handshake error has a source");
        assert!(matches!(
            source.downcast_ref::<RpcError>(),
            Some(RpcError::SessionClosed)
        ));
    }
}
