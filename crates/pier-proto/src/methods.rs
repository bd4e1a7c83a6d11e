//! Method and notification names spoken between the app and an agent server.

pub const INITIALIZE: &str = "initialize";

pub const SESSION_NEW: &str = "session/new";
pub const SESSION_LOAD: &str = "session/load";
pub const SESSION_RESUME: &str = "session/resume";
pub const SESSION_PROMPT: &str = "session/prompt";
pub const SESSION_CANCEL: &str = "session/cancel";
pub const SESSION_LIST: &str = "session/list";
pub const SESSION_SET_MODE: &str = "session/set_mode";

pub const TERMINAL_SPAWN: &str = "terminal/spawn";
pub const TERMINAL_LIST: &str = "terminal/list";
pub const TERMINAL_CONNECT_TMUX: &str = "terminal/connect_tmux";
pub const TERMINAL_INPUT: &str = "terminal/input";
pub const TERMINAL_RESIZE: &str = "terminal/resize";
pub const TERMINAL_CLOSE: &str = "terminal/close";

pub const FS_LIST: &str = "fs/list";

pub const SESSION_UPDATE: &str = "session/update";
pub const SESSION_UPDATE_LEGACY: &str = "notifications/session/update";
pub const TERMINAL_OUTPUT: &str = "terminal/output";
pub const TERMINAL_EXIT: &str = "terminal/exit";

pub fn is_session_update(method: &str) -> bool {
    method == SESSION_UPDATE || method == SESSION_UPDATE_LEGACY
}
