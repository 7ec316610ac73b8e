// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! `.pkt` files: raw requests separated by a single NUL byte.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::Path;

pub const SEPARATOR: u8 = b'\0';

pub struct PacketWriter {
    file: BufWriter<File>,
    written: usize,
}

impl PacketWriter {
    /// Truncates or creates the packet file at `path`.
    ///
    /// # Errors
    ///
    /// Fails when the file or its parent directory cannot be created.
    pub fn create(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        Ok(Self {
            file: BufWriter::new(File::create(path)?),
            written: 0,
        })
    }

    /// Appends `packet`. Empty packets are skipped.
    ///
    /// # Errors
    ///
    /// Propagates write failures.
    pub fn write(&mut self, packet: &[u8]) -> io::Result<()> {
        if packet.is_empty() {
            return Ok(());
        }
        if self.written > 0 {
            self.file.write_all(&[SEPARATOR])?;
        }
        self.file.write_all(packet)?;
        self.written += 1;
        Ok(())
    }

    #[must_use]
    pub fn written(&self) -> usize {
        self.written
    }

    /// Flushes and closes the file, returning the number of packets written.
    ///
    /// # Errors
    ///
    /// Propagates flush failures.
    pub fn finish(mut self) -> io::Result<usize> {
        self.file.flush()?;
        Ok(self.written)
    }
}

/// # Errors
///
/// Fails when the file cannot be read.
pub fn read_packets(path: &Path) -> io::Result<Vec<Vec<u8>>> {
    let content = fs::read(path)?;
    Ok(content
        .split(|&b| b == SEPARATOR)
        .filter(|packet| !packet.is_empty())
        .map(<[u8]>::to_vec)
        .collect())
}
