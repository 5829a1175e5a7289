//! Subprocess execution bounded by a [`Deadline`].

use std::io::Read;
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use crate::control::Deadline;
use crate::error::{Error, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Captured result of a finished subprocess
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    /// stdout followed by stderr, lossily decoded
    pub fn combined_log(&self) -> String {
        let mut log = String::from_utf8_lossy(&self.stdout).into_owned();
        log.push_str(&String::from_utf8_lossy(&self.stderr));
        log
    }
}

/// Run `command` to completion, killing it if `deadline` expires first
///
/// `operation` names the work in the resulting [`Error::Timeout`].
pub fn run(mut command: Command, deadline: Deadline, operation: &str) -> Result<CommandOutput> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = command.spawn()?;

    // Drain both pipes concurrently so a chatty child cannot block on a full pipe
    let stdout_reader = child.stdout.take().map(|mut out| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = out.read_to_end(&mut buf);
            buf
        })
    });
    let stderr_reader = child.stderr.take().map(|mut err| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = err.read_to_end(&mut buf);
            buf
        })
    });

    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if deadline.is_expired() {
            let _ = child.kill();
            let _ = child.wait();
            return Err(deadline.timeout_error(operation));
        }
        let nap = deadline
            .remaining()
            .map_or(POLL_INTERVAL, |left| left.min(POLL_INTERVAL));
        thread::sleep(nap);
    };

    let join = |handle: Option<thread::JoinHandle<Vec<u8>>>| -> Result<Vec<u8>> {
        match handle {
            Some(h) => h.join().map_err(|_| Error::LockPoisoned {
                context: format!("output reader of {}", operation),
            }),
            None => Ok(Vec::new()),
        }
    };

    Ok(CommandOutput {
        status,
        stdout: join(stdout_reader)?,
        stderr: join(stderr_reader)?,
    })
}
