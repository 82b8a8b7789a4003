//! The `-c` command list that loads the bridge plugin inside the runner.

use std::path::{Path, PathBuf};

/// Builder for the runner's initialization commands.
#[derive(Debug, Clone)]
pub struct InitScript {
    plugin_name: String,
    host_path: PathBuf,
    bridge_script: PathBuf,
    prelude: Vec<String>,
    postlude: Vec<String>,
}

impl InitScript {
    pub fn new(
        plugin_name: impl Into<String>,
        host_path: impl Into<PathBuf>,
        bridge_script: impl Into<PathBuf>,
    ) -> Self {
        Self {
            plugin_name: plugin_name.into(),
            host_path: host_path.into(),
            bridge_script: bridge_script.into(),
            prelude: Vec::new(),
            postlude: Vec::new(),
        }
    }

    /// Commands run before anything else.
    pub fn prelude<I, S>(mut self, commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.prelude.extend(commands.into_iter().map(Into::into));
        self
    }

    /// Commands run after the server has been started.
    pub fn postlude<I, S>(mut self, commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.postlude.extend(commands.into_iter().map(Into::into));
        self
    }

    pub fn build(&self) -> Vec<String> {
        let name = &self.plugin_name;
        let script = self.bridge_script.display();
        let mut commands = self.prelude.clone();
        commands.push("let g:denops#_test = 1".to_string());
        commands.push(format!(
            "set runtimepath^={}",
            escape_spaces(&self.host_path)
        ));
        // Older hosts lack `wait_async`; fall back to registering once ready.
        commands.push(
            [
                "try".to_string(),
                format!(
                    "call denops#server#wait_async({{ -> denops#plugin#load('{name}', '{script}') }})"
                ),
                r"catch /^Vim\%((\a\+)\)\=:E117:/".to_string(),
                format!(
                    "execute 'autocmd User DenopsReady call denops#plugin#register(''{name}'', ''{script}'')'"
                ),
                "endtry".to_string(),
            ]
            .join(" | "),
        );
        commands.push("call denops#server#start()".to_string());
        commands.extend(self.postlude.iter().cloned());
        commands
    }
}

fn escape_spaces(path: &Path) -> String {
    path.display().to_string().replace(' ', "\\ ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_are_ordered_around_prelude_and_postlude() {
        let commands = InitScript::new("@plugtest", "/opt/host", "/opt/host/plugtest/bridge")
            .prelude(["echo 'pre'"])
            .postlude(["echo 'post'"])
            .build();
        assert_eq!(commands.len(), 6);
        assert_eq!(commands[0], "echo 'pre'");
        assert_eq!(commands[1], "let g:denops#_test = 1");
        assert_eq!(commands[2], "set runtimepath^=/opt/host");
        assert_eq!(
            commands[3],
            "try | call denops#server#wait_async({ -> denops#plugin#load('@plugtest', '/opt/host/plugtest/bridge') }) \
             | catch /^Vim\\%((\\a\\+)\\)\\=:E117:/ \
             | execute 'autocmd User DenopsReady call denops#plugin#register(''@plugtest'', ''/opt/host/plugtest/bridge'')' \
             | endtry"
        );
        assert_eq!(commands[4], "call denops#server#start()");
        assert_eq!(commands[5], "echo 'post'");
    }

    #[test]
    fn runtimepath_escapes_spaces() {
        let commands = InitScript::new("p", "/path/with some spaces", "/b").build();
        assert_eq!(commands[1], "set runtimepath^=/path/with\\ some\\ spaces");
    }
}
