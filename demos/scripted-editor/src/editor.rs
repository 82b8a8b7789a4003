//! Editor state, ex commands and builtin functions.

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use plugtest_cell::{CellError, PluginProxy};
use plugtest_core::host::context_from_value;
use plugtest_core::{
    BatchCall, Context, Host, HostKind, HostMode, META_FUNCTION, Meta, Platform, RpcError, Value,
};
use tokio::io::AsyncReadExt;
use tokio::task::JoinHandle;

use crate::expr::{self, BinOp, Expr, ParseError, UnaryOp, to_display, to_number};

#[derive(Debug, thiserror::Error)]
pub enum EditorError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("E492: Not an editor command: {0}")]
    NotACommand(String),
    #[error("E117: Unknown function: {0}")]
    UnknownFunction(String),
    #[error("E121: Undefined variable: {0}")]
    UndefinedVariable(String),
    #[error("E461: Illegal variable name: {0}")]
    IllegalVariable(String),
    #[error("E474: Invalid argument for {func}(): {detail}")]
    InvalidArgument { func: String, detail: String },
    #[error("denops: no plugin '{0}' is loaded")]
    NoPlugin(String),
    #[error(transparent)]
    Rpc(#[from] RpcError),
}

impl From<EditorError> for RpcError {
    fn from(err: EditorError) -> Self {
        match err {
            EditorError::Rpc(e) => e,
            other => RpcError::failed(other.to_string()),
        }
    }
}

/// What the command loop should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit(i32),
}

/// Flush stdout and end the process.
pub fn exit(code: i32) -> ! {
    let _ = std::io::stdout().flush();
    std::process::exit(code)
}

pub struct Editor {
    this: Weak<Editor>,
    kind: HostKind,
    meta: Meta,
    globals: Mutex<BTreeMap<String, Value>>,
    /// Name of the plugin the init script asked to load.
    plugin: OnceLock<String>,
    proxy: Mutex<Option<PluginProxy>>,
    /// Output buffers of nested `execute()` calls.
    captures: Mutex<Vec<String>>,
    server: Mutex<Option<JoinHandle<Result<(), CellError>>>>,
}

impl Editor {
    pub fn new(kind: HostKind) -> Arc<Self> {
        let version = match kind {
            HostKind::Vim => "9.1.0",
            HostKind::Nvim => "0.10.0",
        };
        let platform = if cfg!(windows) {
            Platform::Windows
        } else if cfg!(target_os = "macos") {
            Platform::Mac
        } else {
            Platform::Linux
        };
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            kind,
            meta: Meta {
                mode: HostMode::Release,
                host: kind,
                version: version.to_owned(),
                platform,
            },
            globals: Mutex::new(BTreeMap::new()),
            plugin: OnceLock::new(),
            proxy: Mutex::new(None),
            captures: Mutex::new(Vec::new()),
            server: Mutex::new(None),
        })
    }

    pub fn global(&self, name: &str) -> Option<Value> {
        self.globals.lock().get(name).cloned()
    }

    /// Run one ex command line.
    pub fn run_command<'a>(
        &'a self,
        line: &'a str,
        ctx: &'a Context,
    ) -> BoxFuture<'a, Result<Flow, EditorError>> {
        async move {
            let line = line.trim().trim_start_matches(':').trim_start();
            if line.is_empty() || line.starts_with('"') {
                return Ok(Flow::Continue);
            }
            if line.starts_with("try") && line.contains("denops#plugin#load(") {
                self.register_plugin(line);
                return Ok(Flow::Continue);
            }

            let (name, rest) = split_command(line);
            match name.trim_end_matches('!') {
                "let" => self.let_command(rest, ctx).await?,
                "echo" | "echom" | "echomsg" | "echon" => {
                    let mut parts = Vec::new();
                    for expr in expr::parse_list(rest)? {
                        parts.push(to_display(&self.eval(&expr, ctx).await?));
                    }
                    self.message(parts.join(" "));
                }
                "call" | "cal" => {
                    let expr = expr::parse(rest)?;
                    if !matches!(expr, Expr::Call(..)) {
                        return Err(EditorError::NotACommand(line.to_owned()));
                    }
                    self.eval(&expr, ctx).await?;
                }
                "execute" | "exe" | "exec" => {
                    let mut parts = Vec::new();
                    for expr in expr::parse_list(rest)? {
                        parts.push(to_display(&self.eval(&expr, ctx).await?));
                    }
                    return self.run_command(&parts.join(" "), ctx).await;
                }
                "silent" | "sil" => return self.run_command(rest, ctx).await,
                "cquit" | "cq" => return Ok(Flow::Quit(rest.trim().parse().unwrap_or(1))),
                "qall" | "qa" | "quitall" | "quit" | "q" => return Ok(Flow::Quit(0)),
                "sleep" | "sl" => tokio::time::sleep(parse_sleep(rest)).await,
                "set" | "se" | "redir" | "redraw" | "visual" | "vi" | "autocmd" | "au" => {}
                _ => return Err(EditorError::NotACommand(line.to_owned())),
            }
            Ok(Flow::Continue)
        }
        .boxed()
    }

    async fn let_command(&self, rest: &str, ctx: &Context) -> Result<(), EditorError> {
        let (var, expr) = rest
            .split_once('=')
            .ok_or_else(|| EditorError::NotACommand(format!("let{rest}")))?;
        let var = var.trim();
        let name = match var.split_once(':') {
            None => var,
            Some(("g", name)) => name,
            Some(_) => return Err(EditorError::IllegalVariable(var.to_owned())),
        };
        if name.is_empty() {
            return Err(EditorError::IllegalVariable(var.to_owned()));
        }
        let value = self.eval(&expr::parse(expr)?, ctx).await?;
        self.globals.lock().insert(name.to_owned(), value);
        Ok(())
    }

    /// Remember the plugin name from the bridge loading line of the init script.
    fn register_plugin(&self, line: &str) {
        const LOAD: &str = "denops#plugin#load('";
        let name = line
            .find(LOAD)
            .map(|start| &line[start + LOAD.len()..])
            .and_then(|rest| rest.split_once('\''))
            .map(|(name, _)| name.to_owned());
        match name {
            Some(name) => {
                tracing::debug!(%name, "plugin registered");
                let _ = self.plugin.set(name);
            }
            None => tracing::warn!(line, "cannot find the plugin name"),
        }
    }

    fn message(&self, text: String) {
        let mut captures = self.captures.lock();
        if let Some(buffer) = captures.last_mut() {
            buffer.push('\n');
            buffer.push_str(&text);
            return;
        }
        drop(captures);
        let mut stdout = std::io::stdout().lock();
        let _ = writeln!(stdout, "{text}");
        let _ = stdout.flush();
    }

    pub fn eval<'a>(
        &'a self,
        expr: &'a Expr,
        ctx: &'a Context,
    ) -> BoxFuture<'a, Result<Value, EditorError>> {
        async move {
            match expr {
                Expr::Literal(value) => Ok(value.clone()),
                Expr::List(items) => {
                    let mut values = Vec::with_capacity(items.len());
                    for item in items {
                        values.push(self.eval(item, ctx).await?);
                    }
                    Ok(Value::Array(values))
                }
                Expr::Dict(entries) => {
                    let mut map = Vec::with_capacity(entries.len());
                    for (key, value) in entries {
                        let key = to_display(&self.eval(key, ctx).await?);
                        map.push((Value::from(key), self.eval(value, ctx).await?));
                    }
                    Ok(Value::Map(map))
                }
                Expr::Var(name) => self.variable(name, ctx),
                Expr::Call(name, args) => {
                    let mut values = Vec::with_capacity(args.len());
                    for arg in args {
                        values.push(self.eval(arg, ctx).await?);
                    }
                    self.call_function(name, values).await
                }
                Expr::Unary(op, operand) => {
                    let n = to_number(&self.eval(operand, ctx).await?);
                    Ok(Value::from(match op {
                        UnaryOp::Neg => -n,
                        UnaryOp::Not => i64::from(n == 0),
                    }))
                }
                Expr::Binary(op, lhs, rhs) => {
                    let lhs = self.eval(lhs, ctx).await?;
                    let rhs = self.eval(rhs, ctx).await?;
                    Ok(binary(*op, &lhs, &rhs))
                }
            }
        }
        .boxed()
    }

    fn variable(&self, name: &str, ctx: &Context) -> Result<Value, EditorError> {
        let found = match name.split_once(':') {
            Some(("v", "true")) => Some(Value::Boolean(true)),
            Some(("v", "false")) => Some(Value::Boolean(false)),
            Some(("v", "null")) => Some(Value::Nil),
            Some(("l", local)) => ctx.get(local).cloned(),
            Some(("g", global)) => self.global(global),
            None => self.global(name),
            Some(_) => None,
        };
        found.ok_or_else(|| EditorError::UndefinedVariable(name.to_owned()))
    }

    /// Call a builtin or `denops#` function.
    pub fn call_function<'a>(
        &'a self,
        name: &'a str,
        args: Vec<Value>,
    ) -> BoxFuture<'a, Result<Value, EditorError>> {
        async move {
            let arg = |i: usize| args.get(i).cloned().unwrap_or(Value::Nil);
            match name {
                "range" => {
                    let (start, end) = match args.as_slice() {
                        [n] => (0, to_number(n)),
                        [a, b] => (to_number(a), to_number(b) + 1),
                        _ => return Err(invalid(name, "expected 1 or 2 arguments")),
                    };
                    Ok(Value::Array((start..end).map(Value::from).collect()))
                }
                "has" => {
                    let feature = string_arg(name, &arg(0))?;
                    let has = match feature.as_str() {
                        "nvim" => self.kind == HostKind::Nvim,
                        "vim9script" => self.kind == HostKind::Vim,
                        "unix" => cfg!(unix),
                        "win32" => cfg!(windows),
                        _ => false,
                    };
                    Ok(Value::from(i64::from(has)))
                }
                "abs" => Ok(Value::from(to_number(&arg(0)).abs())),
                "len" => Ok(Value::from(match arg(0) {
                    Value::Array(items) => items.len() as i64,
                    Value::Map(entries) => entries.len() as i64,
                    other => to_display(&other).len() as i64,
                })),
                "execute" => {
                    let commands = match arg(0) {
                        Value::Array(items) => items.iter().map(to_display).collect(),
                        other => vec![to_display(&other)],
                    };
                    self.execute_capturing(&commands).await.map(Value::from)
                }
                META_FUNCTION => {
                    let mut meta = self.meta.clone();
                    if self.global("denops#_test").is_some_and(|v| to_number(&v) != 0) {
                        meta.mode = HostMode::Test;
                    }
                    Ok(meta.to_value())
                }
                "denops#server#start" => {
                    self.start_server();
                    Ok(Value::from(0))
                }
                "denops#notify" => {
                    let plugin = string_arg(name, &arg(0))?;
                    let func = string_arg(name, &arg(1))?;
                    let args = list_arg(name, arg(2))?;
                    let proxy = self.proxy_for(&plugin)?;
                    tokio::spawn(async move {
                        if let Err(e) = proxy.dispatch(&func, args).await {
                            tracing::warn!(%func, error = %e, "denops#notify failed");
                        }
                    });
                    Ok(Value::from(0))
                }
                "denops#request" => {
                    let plugin = string_arg(name, &arg(0))?;
                    let func = string_arg(name, &arg(1))?;
                    let args = list_arg(name, arg(2))?;
                    Ok(self.proxy_for(&plugin)?.dispatch(&func, args).await?)
                }
                "denops#api#cmd" => {
                    let cmd = string_arg(name, &arg(0))?;
                    let ctx = context_from_value(arg(1))?;
                    if let Flow::Quit(code) = self.run_command(&cmd, &ctx).await? {
                        exit(code);
                    }
                    Ok(Value::from(0))
                }
                "denops#api#eval" => {
                    let source = string_arg(name, &arg(0))?;
                    let ctx = context_from_value(arg(1))?;
                    self.eval(&expr::parse(&source)?, &ctx).await
                }
                _ => Err(EditorError::UnknownFunction(name.to_owned())),
            }
        }
        .boxed()
    }

    /// Run `commands`, returning what they echoed the way `execute()` does.
    async fn execute_capturing(&self, commands: &[String]) -> Result<String, EditorError> {
        self.captures.lock().push(String::new());
        let ctx = Context::new();
        let mut result = Ok(());
        for command in commands {
            match self.run_command(command, &ctx).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Quit(code)) => exit(code),
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }
        let output = self.captures.lock().pop().unwrap_or_default();
        result.map(|()| output)
    }

    fn proxy_for(&self, plugin: &str) -> Result<PluginProxy, EditorError> {
        let proxy = self.proxy.lock().clone();
        match proxy {
            Some(proxy) if self.plugin.get().is_some_and(|name| name == plugin) => Ok(proxy),
            _ => Err(EditorError::NoPlugin(plugin.to_owned())),
        }
    }

    /// Load the registered plugin: dial the harness and serve it in the background.
    fn start_server(&self) {
        let Some(editor) = self.this.upgrade() else {
            return;
        };
        let mut server = self.server.lock();
        if server.is_some() {
            return;
        }
        if self.plugin.get().is_none() {
            tracing::debug!("server started without a plugin to load");
            return;
        }
        *server = Some(tokio::spawn(async move {
            plugtest_cell::run_with_session(move |proxy| {
                *editor.proxy.lock() = Some(proxy);
                editor
            })
            .await
        }));
    }

    /// Keep running once the command line is done. Returns the exit code.
    ///
    /// With the bridge loaded, that is until the harness hangs up. Otherwise
    /// until stdin closes.
    pub async fn idle(&self) -> i32 {
        let server = self.server.lock().take();
        match server {
            Some(server) => match server.await {
                Ok(Ok(())) => 0,
                Ok(Err(e)) => {
                    eprintln!("[scripted-editor] bridge failed: {e}");
                    1
                }
                Err(e) => {
                    eprintln!("[scripted-editor] bridge task failed: {e}");
                    1
                }
            },
            None => {
                let mut sink = Vec::new();
                let _ = tokio::io::stdin().read_to_end(&mut sink).await;
                0
            }
        }
    }
}

/// `name!` and its argument text.
fn split_command(line: &str) -> (&str, &str) {
    let end = line
        .find(|c: char| !c.is_ascii_alphabetic())
        .unwrap_or(line.len());
    let end = if line[end..].starts_with('!') { end + 1 } else { end };
    (&line[..end], &line[end..])
}

/// `:sleep` takes seconds, or milliseconds with an `m` suffix.
fn parse_sleep(arg: &str) -> Duration {
    let arg = arg.trim();
    match arg.strip_suffix('m') {
        Some(ms) => Duration::from_millis(ms.trim().parse().unwrap_or(0)),
        None if arg.is_empty() => Duration::from_secs(1),
        None => Duration::from_secs(arg.parse().unwrap_or(0)),
    }
}

fn binary(op: BinOp, lhs: &Value, rhs: &Value) -> Value {
    let (a, b) = (to_number(lhs), to_number(rhs));
    match op {
        BinOp::Add => Value::from(a.wrapping_add(b)),
        BinOp::Sub => Value::from(a.wrapping_sub(b)),
        BinOp::Mul => Value::from(a.wrapping_mul(b)),
        BinOp::Div => Value::from(a.checked_div(b).unwrap_or(0)),
        BinOp::Rem => Value::from(a.checked_rem(b).unwrap_or(0)),
        BinOp::Concat => Value::from(format!("{}{}", to_display(lhs), to_display(rhs))),
        BinOp::Eq | BinOp::Ne => {
            let equal = match (lhs, rhs) {
                (Value::String(_), Value::String(_)) => to_display(lhs) == to_display(rhs),
                (Value::String(_) | Value::Integer(_), Value::String(_) | Value::Integer(_)) => {
                    a == b
                }
                _ => lhs == rhs,
            };
            Value::from(i64::from(equal == (op == BinOp::Eq)))
        }
    }
}

fn invalid(func: &str, detail: impl Into<String>) -> EditorError {
    EditorError::InvalidArgument {
        func: func.to_owned(),
        detail: detail.into(),
    }
}

fn string_arg(func: &str, value: &Value) -> Result<String, EditorError> {
    value
        .as_str()
        .map(str::to_owned)
        .ok_or_else(|| invalid(func, format!("expected a string, got {value}")))
}

fn list_arg(func: &str, value: Value) -> Result<Vec<Value>, EditorError> {
    match value {
        Value::Array(items) => Ok(items),
        Value::Nil => Ok(Vec::new()),
        other => Err(invalid(func, format!("expected a list, got {other}"))),
    }
}

impl Host for Editor {
    fn name(&self) -> &str {
        self.plugin.get().map(String::as_str).unwrap_or_default()
    }

    fn meta(&self) -> &Meta {
        &self.meta
    }

    async fn redraw(&self, _force: Option<bool>) -> Result<(), RpcError> {
        Ok(())
    }

    async fn call(&self, func: &str, args: Vec<Value>) -> Result<Value, RpcError> {
        Ok(self.call_function(func, args).await?)
    }

    async fn batch(&self, calls: Vec<BatchCall>) -> Result<Vec<Value>, RpcError> {
        let mut results = Vec::with_capacity(calls.len());
        for call in calls {
            results.push(self.call_function(&call.func, call.args).await?);
        }
        Ok(results)
    }

    async fn cmd(&self, cmd: &str, ctx: Context) -> Result<(), RpcError> {
        match self.run_command(cmd, &ctx).await? {
            Flow::Continue => Ok(()),
            Flow::Quit(code) => exit(code),
        }
    }

    async fn eval(&self, expr: &str, ctx: Context) -> Result<Value, RpcError> {
        let expr = expr::parse(expr).map_err(EditorError::from)?;
        Ok(Editor::eval(self, &expr, &ctx).await?)
    }

    async fn dispatch(&self, plugin: &str, func: &str, args: Vec<Value>) -> Result<Value, RpcError> {
        Ok(self.proxy_for(plugin)?.dispatch(func, args).await?)
    }
}
