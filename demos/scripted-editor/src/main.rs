//! A scriptable vim/neovim stand-in.
//!
//! Accepts the argument vectors the harness builds for either runner, executes
//! the `--cmd`/`-c` commands in order, and when the init script starts the
//! server, loads the plugtest bridge so the harness can drive it over RPC.
//!
//! # Usage
//!
//! ```bash
//! # behaves as vim
//! scripted-editor -u NONE -i NONE -n -N -X -e -s -c visual -c "echomsg 'hi'" -c qall!
//!
//! # behaves as neovim
//! scripted-editor --clean --embed --headless -n -c "echo has('nvim')" -c qall!
//! ```

mod editor;
mod expr;

use plugtest_core::{Context, HostKind};

use crate::editor::{Editor, Flow};

#[derive(Debug)]
struct Args {
    kind: HostKind,
    commands: Vec<String>,
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Args {
    let mut kind = HostKind::Vim;
    let mut before = Vec::new();
    let mut after = Vec::new();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--cmd" => before.extend(args.next()),
            "-c" => after.extend(args.next()),
            "--headless" | "--embed" => kind = HostKind::Nvim,
            "-u" | "-i" => {
                args.next();
            }
            _ => {}
        }
    }
    before.extend(after);
    Args {
        kind,
        commands: before,
    }
}

fn main() {
    plugtest_cell::tracing_setup::init();
    let args = parse_args(std::env::args().skip(1));
    tracing::debug!(?args, "starting");

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("[scripted-editor] failed to start runtime: {e}");
            editor::exit(1);
        }
    };
    let code = runtime.block_on(run(args));
    editor::exit(code)
}

async fn run(args: Args) -> i32 {
    let editor = Editor::new(args.kind);
    let ctx = Context::new();
    for command in &args.commands {
        match editor.run_command(command, &ctx).await {
            Ok(Flow::Continue) => {}
            Ok(Flow::Quit(code)) => return code,
            Err(e) => eprintln!("Error detected while processing command line:\n{e}"),
        }
    }
    editor.idle().await
}
