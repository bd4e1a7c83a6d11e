#![allow(dead_code)]

use std::path::Path;
use std::time::Duration;

/// Shell command that prints the shell's own pid as `pid=<n>`.
pub const PRINT_PID: &str = "echo pid=$$\n";

/// The pid printed by [`PRINT_PID`], once a complete line of it has arrived.
/// The echoed command line itself reads `pid=$$` and is skipped.
pub fn shell_pid(output: &str) -> Option<u32> {
    output.match_indices("pid=").find_map(|(index, marker)| {
        let rest = &output[index + marker.len()..];
        let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
        let terminated = rest[digits.len()..].starts_with(['\r', '\n']);
        if digits.is_empty() || !terminated {
            return None;
        }
        digits.parse().ok()
    })
}

/// Wait until `pid` is gone from the process table, which also means it
/// was reaped rather than left as a zombie.
pub async fn wait_until_reaped(pid: u32) {
    let entry = format!("/proc/{pid}");
    for _ in 0..400 {
        if !Path::new(&entry).exists() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("shell {pid} outlived its connection");
}

#[test]
fn pid_line_is_parsed_after_the_echoed_command() {
    assert_eq!(shell_pid("$ echo pid=$$\r\n"), None);
    assert_eq!(shell_pid("$ echo pid=$$\r\npid=4321"), None);
    assert_eq!(shell_pid("$ echo pid=$$\r\npid=4321\r\n$ "), Some(4321));
}
