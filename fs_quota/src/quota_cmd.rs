//
// Quota as reported by the quota(1) command.
//
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crate::{FqError, QuotaReader, RawSample};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone)]
pub struct QuotaCmdOptions {
    /// Path of the quota binary.
    pub command:    PathBuf,
    /// Bytes per block in the command's output.
    pub block_size: u64,
    pub timeout:    Duration,
}

impl Default for QuotaCmdOptions {
    fn default() -> QuotaCmdOptions {
        QuotaCmdOptions {
            command:    PathBuf::from("/bin/quota"),
            block_size: 1024,
            timeout:    Duration::from_secs(30),
        }
    }
}

/// Reads xfs quota by running `quota -w --hide-device -p -u <user>`.
///
/// quota(1) cannot be asked for one filesystem and one user at the same
/// time, so the path is not passed on and the last line of the output is
/// taken as the answer.
#[derive(Debug, Clone, Default)]
pub struct QuotaCmdReader {
    opts: QuotaCmdOptions,
}

impl QuotaCmdReader {
    pub fn new(opts: QuotaCmdOptions) -> QuotaCmdReader {
        QuotaCmdReader { opts }
    }

    fn run(&self, user: &str) -> Result<String, FqError> {
        let cmd = &self.opts.command;
        let mut child = Command::new(cmd)
            .args(&["-w", "--hide-device", "-p", "-u", user])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                match e.kind() {
                    io::ErrorKind::NotFound => FqError::CommandNotFound(cmd.clone()),
                    _ => FqError::CommandFailed { cmd: cmd.clone(), source: e },
                }
            })?;

        // drain stdout on a thread so a chatty child cannot block on a full pipe.
        let mut stdout = child.stdout.take();
        let reader = thread::spawn(move || {
            let mut buf = Vec::new();
            if let Some(ref mut out) = stdout {
                out.read_to_end(&mut buf)?;
            }
            Ok::<_, io::Error>(buf)
        });

        let status = wait_or_kill(&mut child, self.opts.timeout, Child::try_wait).map_err(|e| {
            FqError::CommandFailed {
                cmd:    cmd.clone(),
                source: e,
            }
        })?;
        let status = match status {
            Some(s) => s,
            None => return Err(FqError::Timeout(cmd.clone(), self.opts.timeout.as_secs())),
        };
        // quota(1) exits non-zero when the user is over quota, that is not an error here.
        debug!("{} -u {}: {}", cmd.display(), user, status);

        let buf = match reader.join() {
            Ok(res) => res?,
            Err(_) => return Err(FqError::Parse("output reader panicked".to_string())),
        };
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

// Wait for the child, giving up after `timeout`. Ok(None) means it timed out.
// Unless it exited by itself the child is killed and reaped before we return.
fn wait_or_kill<F>(child: &mut Child, timeout: Duration, mut poll: F) -> io::Result<Option<ExitStatus>>
where F: FnMut(&mut Child) -> io::Result<Option<ExitStatus>> {
    let start = Instant::now();
    loop {
        match poll(child) {
            Ok(Some(status)) => return Ok(Some(status)),
            Ok(None) => {},
            Err(e) => {
                kill_and_reap(child);
                return Err(e);
            },
        }
        if start.elapsed() >= timeout {
            kill_and_reap(child);
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn kill_and_reap(child: &mut Child) {
    if let Err(e) = child.kill() {
        debug!("kill pid {}: {}", child.id(), e);
    }
    if let Err(e) = child.wait() {
        warn!("wait for pid {}: {}", child.id(), e);
    }
}

/// Parse the output of `quota -w --hide-device -p`.
///
/// The last non-empty line must hold exactly eight numbers: blocks used,
/// soft, hard, grace, then files used, soft, hard, grace. Asterisks that
/// mark an exceeded limit are dropped.
pub fn parse_quota_output(output: &str, block_size: u64) -> Result<RawSample, FqError> {
    let line = output
        .lines()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty())
        .last()
        .ok_or_else(|| FqError::Parse(output.to_string()))?;
    let line = line.replace('*', "");

    let tokens = line
        .split_whitespace()
        .map(|t| t.parse::<u64>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| FqError::Parse(line.clone()))?;
    if tokens.len() != 8 {
        return Err(FqError::Parse(line));
    }

    Ok(RawSample {
        blocks_used: tokens[0],
        blocks_soft: tokens[1],
        blocks_hard: tokens[2],
        blocks_grace: Some(tokens[3]),
        files_used: tokens[4],
        files_soft: tokens[5],
        files_hard: tokens[6],
        files_grace: Some(tokens[7]),
        block_size,
    })
}

impl QuotaReader for QuotaCmdReader {
    fn read(&self, user: &str, _path: &Path) -> Result<RawSample, FqError> {
        let output = self.run(user)?;
        parse_quota_output(&output, self.opts.block_size)
    }
}
