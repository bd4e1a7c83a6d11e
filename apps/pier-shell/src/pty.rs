use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtyPair, PtySize};
use tokio::task::{self, JoinHandle};
use tracing::{debug, trace};

use crate::utf8::Utf8Carry;

pub const MIN_DIMENSION: u16 = 1;
pub const MAX_DIMENSION: u16 = 500;

const EXIT_POLL: Duration = Duration::from_millis(25);

#[derive(Clone, Debug)]
pub struct Command {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
}

impl Command {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            cwd: None,
        }
    }

    pub fn args<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(values.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn cwd(mut self, path: impl Into<PathBuf>) -> Self {
        self.cwd = Some(path.into());
        self
    }
}

#[derive(Clone, Debug)]
pub struct SpawnConfig {
    pub command: Command,
    pub cols: u16,
    pub rows: u16,
}

impl SpawnConfig {
    pub fn new(command: Command, cols: u16, rows: u16) -> Self {
        Self {
            command,
            cols: clamp_dimension(cols),
            rows: clamp_dimension(rows),
        }
    }
}

pub fn clamp_dimension(value: u16) -> u16 {
    value.clamp(MIN_DIMENSION, MAX_DIMENSION)
}

/// A child process attached to a pseudo-terminal. Dropping it kills the
/// child.
pub struct PtyProcess {
    master: Mutex<Box<dyn MasterPty + Send>>,
    child: Mutex<Option<Box<dyn Child + Send + Sync>>>,
    exit_code: Mutex<Option<i32>>,
}

impl PtyProcess {
    pub fn spawn(config: SpawnConfig) -> Result<(Self, PtyReader, PtyWriter)> {
        let mut pair = spawn_pair(config.rows, config.cols)?;
        let child = spawn_child(&mut pair, &config.command)?;
        let master = pair.master;
        let reader = master.try_clone_reader().context("clone PTY reader")?;
        let writer = master.take_writer().context("take PTY writer")?;
        debug!(
            target: "pier_shell::pty",
            program = %config.command.program,
            pid = ?child.process_id(),
            cols = config.cols,
            rows = config.rows,
            "spawned pty child"
        );

        let process = Self {
            master: Mutex::new(master),
            child: Mutex::new(Some(child)),
            exit_code: Mutex::new(None),
        };

        Ok((process, PtyReader::new(reader), PtyWriter::new(writer)))
    }

    /// Exit code once the child has exited, without blocking.
    pub fn try_exit_code(&self) -> Result<Option<i32>> {
        let mut exit_code = self.exit_code.lock();
        if exit_code.is_some() {
            return Ok(*exit_code);
        }
        let mut child = self.child.lock();
        let Some(running) = child.as_mut() else {
            return Ok(*exit_code);
        };
        match running.try_wait().context("poll PTY child")? {
            Some(status) => {
                let code = status.exit_code() as i32;
                *exit_code = Some(code);
                child.take();
                Ok(Some(code))
            }
            None => Ok(None),
        }
    }

    /// Wait for the child to exit. Polls so that [`PtyProcess::shutdown`]
    /// can still reach the child meanwhile.
    pub async fn wait(&self) -> Result<i32> {
        loop {
            if let Some(code) = self.try_exit_code()? {
                return Ok(code);
            }
            tokio::time::sleep(EXIT_POLL).await;
        }
    }

    /// Kill the child if it is still running.
    pub fn shutdown(&self) {
        let mut exit_code = self.exit_code.lock();
        let Some(mut child) = self.child.lock().take() else {
            return;
        };
        let _ = child.kill();
        let code = child
            .wait()
            .map(|status| status.exit_code() as i32)
            .unwrap_or(-1);
        exit_code.get_or_insert(code);
        debug!(target: "pier_shell::pty", code, "pty child stopped");
    }

    /// Resize the terminal; both dimensions are clamped to 1..=500.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        let size = PtySize {
            rows: clamp_dimension(rows),
            cols: clamp_dimension(cols),
            pixel_width: 0,
            pixel_height: 0,
        };
        trace!(target: "pier_shell::pty", cols = size.cols, rows = size.rows, "resize");
        self.master.lock().resize(size).context("resize PTY")
    }

    pub fn size(&self) -> Result<(u16, u16)> {
        let size = self.master.lock().get_size().context("query PTY size")?;
        Ok((size.cols, size.rows))
    }
}

impl Drop for PtyProcess {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[derive(Clone)]
pub struct PtyReader {
    reader: Arc<Mutex<Box<dyn Read + Send>>>,
}

impl PtyReader {
    const CHUNK: usize = 4096;

    fn new(reader: Box<dyn Read + Send>) -> Self {
        Self {
            reader: Arc::new(Mutex::new(reader)),
        }
    }

    /// `None` at end of output. Linux reports a closed PTY as an I/O
    /// error rather than EOF; callers treat both as the end.
    pub async fn read_chunk(&self) -> Result<Option<Vec<u8>>> {
        let reader = self.reader.clone();
        task::spawn_blocking(move || {
            let mut guard = reader.lock();
            let mut buffer = vec![0u8; Self::CHUNK];
            loop {
                match guard.read(&mut buffer) {
                    Ok(0) => return Ok(None),
                    Ok(n) => {
                        buffer.truncate(n);
                        return Ok(Some(buffer));
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(err) => return Err(err.into()),
                }
            }
        })
        .await
        .context("join PTY read task")?
    }
}

#[derive(Clone)]
pub struct PtyWriter {
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl PtyWriter {
    fn new(writer: Box<dyn Write + Send>) -> Self {
        Self {
            writer: Arc::new(Mutex::new(writer)),
        }
    }

    pub fn write(&self, bytes: &[u8]) -> Result<()> {
        let mut guard = self.writer.lock();
        guard.write_all(bytes).context("write to PTY")?;
        guard.flush().context("flush PTY writer")?;
        Ok(())
    }

    /// Write from async code without stalling a runtime worker when the
    /// PTY's input buffer is full.
    pub async fn write_async(&self, bytes: Vec<u8>) -> Result<()> {
        let writer = self.clone();
        task::spawn_blocking(move || writer.write(&bytes))
            .await
            .context("join PTY write task")?
    }
}

/// Forward PTY output as UTF-8 text until the child's output ends, then
/// return its exit code. When `emit` reports the consumer is gone the
/// child is killed.
pub async fn pump_output<F>(reader: PtyReader, process: &PtyProcess, mut emit: F) -> Result<i32>
where
    F: FnMut(String) -> bool,
{
    let mut carry = Utf8Carry::default();
    loop {
        match reader.read_chunk().await {
            Ok(Some(bytes)) => {
                let text = carry.push(&bytes);
                if !text.is_empty() && !emit(text) {
                    debug!(target: "pier_shell::pty", "output consumer gone; stopping child");
                    process.shutdown();
                    break;
                }
            }
            Ok(None) => break,
            Err(err) => {
                trace!(target: "pier_shell::pty", error = %err, "pty read ended");
                break;
            }
        }
    }
    let tail = carry.finish();
    if !tail.is_empty() {
        emit(tail);
    }
    process.wait().await
}

/// Wait up to `grace` for an output pump to finish, then abort it. A
/// background job that inherited the PTY can keep the reader from ever
/// seeing EOF. Returns false when the pump had to be aborted.
pub async fn join_or_abort(mut pump: JoinHandle<()>, grace: Duration) -> bool {
    match tokio::time::timeout(grace, &mut pump).await {
        Ok(_) => true,
        Err(_) => {
            debug!(target: "pier_shell::pty", ?grace, "output pump still running; aborting");
            pump.abort();
            false
        }
    }
}

fn spawn_pair(rows: u16, cols: u16) -> Result<PtyPair> {
    let pty_system = native_pty_system();
    let size = PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    };
    pty_system.openpty(size).context("open PTY pair")
}

fn spawn_child(pair: &mut PtyPair, command: &Command) -> Result<Box<dyn Child + Send + Sync>> {
    let mut cmd = CommandBuilder::new(&command.program);
    for arg in &command.args {
        cmd.arg(arg);
    }
    for (key, value) in &command.env {
        cmd.env(key, value);
    }
    if let Some(cwd) = &command.cwd {
        cmd.cwd(Path::new(cwd));
    }
    pair.slave
        .spawn_command(cmd)
        .with_context(|| format!("spawn {}", command.program))
}
