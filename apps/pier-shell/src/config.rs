use std::env;
use std::net::SocketAddr;
use std::path::Path;

use crate::error::ShellError;
use crate::pty::Command;

pub const DEFAULT_WS_ADDR: &str = "127.0.0.1:8766";
pub const DEFAULT_RPC_ADDR: &str = "127.0.0.1:8767";
pub const DEFAULT_COLS: u16 = 80;
pub const DEFAULT_ROWS: u16 = 24;

#[derive(Debug, Clone)]
pub struct ShellConfig {
    /// Standalone PTY WebSocket listener.
    pub ws_addr: SocketAddr,
    /// NDJSON JSON-RPC terminal host listener.
    pub rpc_addr: SocketAddr,
    pub shell: String,
    pub cols: u16,
    pub rows: u16,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            ws_addr: SocketAddr::from(([127, 0, 0, 1], 8766)),
            rpc_addr: SocketAddr::from(([127, 0, 0, 1], 8767)),
            shell: "/bin/sh".to_string(),
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
        }
    }
}

impl ShellConfig {
    /// Reads `PIER_SHELL_WS_ADDR`, `PIER_SHELL_RPC_ADDR`, `PIER_SHELL_COLS`,
    /// `PIER_SHELL_ROWS` and `SHELL`.
    pub fn from_env() -> Result<Self, ShellError> {
        let defaults = Self::default();
        Ok(Self {
            ws_addr: env_parsed("PIER_SHELL_WS_ADDR")?.unwrap_or(defaults.ws_addr),
            rpc_addr: env_parsed("PIER_SHELL_RPC_ADDR")?.unwrap_or(defaults.rpc_addr),
            shell: env::var("SHELL")
                .ok()
                .filter(|shell| !shell.is_empty())
                .unwrap_or(defaults.shell),
            cols: env_parsed("PIER_SHELL_COLS")?.unwrap_or(defaults.cols),
            rows: env_parsed("PIER_SHELL_ROWS")?.unwrap_or(defaults.rows),
        })
    }

    /// Login shell command for a new terminal.
    pub fn shell_command(&self, cwd: Option<&str>) -> Command {
        let mut command = Command::new(&self.shell).env("TERM", "xterm-256color");
        if let Some(cwd) = cwd {
            command = command.cwd(cwd);
        }
        command
    }

    /// Display name for shell terminals, e.g. `bash`.
    pub fn shell_name(&self) -> String {
        Path::new(&self.shell)
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("shell")
            .to_string()
    }
}

fn env_parsed<T: std::str::FromStr>(key: &'static str) -> Result<Option<T>, ShellError> {
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ShellError::Config { key, value }),
        _ => Ok(None),
    }
}
