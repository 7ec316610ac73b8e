// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Drives the load generator.
//!
//! The generator is a black box that replays a packet file against a
//! destination and narrates every packet it writes and receives on its
//! standard streams. Both streams are forwarded to a sink one line at a
//! time, newline included, in the order they become readable.

use std::io;
use std::path::Path;
use std::process::Stdio;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::GeneratorConfig;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("generator i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("generator interrupted")]
    Cancelled,
}

enum Event {
    Stdout(io::Result<usize>),
    Stderr(io::Result<usize>),
    Interrupted,
}

#[derive(Debug, Clone)]
pub struct GeneratorRunner {
    config: GeneratorConfig,
}

impl GeneratorRunner {
    #[must_use]
    pub fn new(config: GeneratorConfig) -> Self {
        Self { config }
    }

    /// Command line replaying `packet_path` once, in order, against
    /// `destination`.
    #[must_use]
    pub fn args(&self, packet_path: &Path, destination: &str) -> Vec<String> {
        let timeout = &self.config.timeout;
        let timeout_secs = timeout.as_secs() + u64::from(timeout.subsec_nanos() > 0);
        vec![
            "-F".to_string(),
            packet_path.display().to_string(),
            "-v".to_string(),
            self.config.verbosity.to_string(),
            destination.to_string(),
            "-n".to_string(),
            self.config.repetitions.to_string(),
            "-c".to_string(),
            self.config.concurrency.to_string(),
            "-r".to_string(),
            "-s".to_string(),
            timeout_secs.to_string(),
            "-o".to_string(),
            "/dev/null".to_string(),
        ]
    }

    /// Runs the generator to completion and returns its exit code.
    ///
    /// # Errors
    ///
    /// Fails when the generator cannot be spawned or read, and with
    /// [`RunnerError::Cancelled`] when `cancel` fires or the user interrupts
    /// the run; the child is killed in both cases.
    pub async fn run<F>(
        &self,
        packet_path: &Path,
        destination: &str,
        cancel: &CancellationToken,
        mut sink: F,
    ) -> Result<i32, RunnerError>
    where
        F: FnMut(&[u8]),
    {
        let args = self.args(packet_path, destination);
        debug!("Running {} {}", self.config.program, args.join(" "));
        let mut child = Command::new(&self.config.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| RunnerError::Spawn {
                program: self.config.program.clone(),
                source,
            })?;

        let mut stdout = child.stdout.take().map(BufReader::new);
        let mut stderr = child.stderr.take().map(BufReader::new);
        let mut out_line = Vec::new();
        let mut err_line = Vec::new();

        while stdout.is_some() || stderr.is_some() {
            // Cancellation wins over output that is already buffered.
            let event = tokio::select! {
                biased;
                () = cancel.cancelled() => Event::Interrupted,
                read = read_line(&mut stdout, &mut out_line), if stdout.is_some() => Event::Stdout(read),
                read = read_line(&mut stderr, &mut err_line), if stderr.is_some() => Event::Stderr(read),
                _ = tokio::signal::ctrl_c() => Event::Interrupted,
            };
            match event {
                Event::Stdout(read) => {
                    if forward(read?, &mut out_line, &mut sink) {
                        stdout = None;
                    }
                }
                Event::Stderr(read) => {
                    if forward(read?, &mut err_line, &mut sink) {
                        stderr = None;
                    }
                }
                Event::Interrupted => {
                    warn!("Interrupting generator");
                    child.kill().await?;
                    return Err(RunnerError::Cancelled);
                }
            }
        }

        let status = child.wait().await?;
        let code = status.code().unwrap_or(-1);
        info!(code, "Generator exited");
        Ok(code)
    }

    /// [`Self::run`] on a dedicated current-thread runtime, for callers that
    /// live outside of any runtime.
    ///
    /// # Errors
    ///
    /// See [`Self::run`].
    pub fn run_blocking<F>(
        &self,
        packet_path: &Path,
        destination: &str,
        cancel: &CancellationToken,
        sink: F,
    ) -> Result<i32, RunnerError>
    where
        F: FnMut(&[u8]),
    {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        runtime.block_on(self.run(packet_path, destination, cancel, sink))
    }
}

async fn read_line<R>(reader: &mut Option<BufReader<R>>, line: &mut Vec<u8>) -> io::Result<usize>
where
    R: tokio::io::AsyncRead + Unpin,
{
    match reader {
        Some(reader) => reader.read_until(b'\n', line).await,
        None => Ok(0),
    }
}

/// Hands a complete line to `sink`. Returns whether the stream ended.
fn forward<F>(read: usize, line: &mut Vec<u8>, sink: &mut F) -> bool
where
    F: FnMut(&[u8]),
{
    let closed = read == 0;
    if line.is_empty() {
        return closed;
    }
    if line.last() != Some(&b'\n') {
        if !closed {
            return false;
        }
        line.push(b'\n');
    }
    sink(line);
    line.clear();
    closed
}
