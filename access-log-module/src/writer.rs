// Copyright 2024 Wladimir Palant
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Destinations for access log lines

use flate2::write::GzEncoder;
use flate2::Compression;
use log::{debug, error, warn};
use parking_lot::Mutex;
use std::fmt::Debug;
use std::fs::{self, File};
use std::io::{self, stdout, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime};

use crate::file_set::{LogFileSet, RotatedFile, COMPRESSED_SUFFIX};
use crate::guardian::{create_log_file, open_log_file};

/// Destination accepting complete log lines
pub trait LineSink: Debug + Send + Sync {
    /// Appends a line, the line terminator is added by the sink.
    fn write_line(&self, line: &str) -> io::Result<()>;
}

/// Sink writing log lines to the standard output
#[derive(Debug, Default, Clone, Copy)]
pub struct StdoutSink;

impl LineSink for StdoutSink {
    fn write_line(&self, line: &str) -> io::Result<()> {
        let mut out = stdout().lock();
        writeln!(out, "{line}")?;
        out.flush()
    }
}

/// Rotation settings of a [`RotatingFile`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationPolicy {
    /// Size in bytes the live file isn’t allowed to exceed. 0 disables size-based rotation, the
    /// file will grow without bounds then.
    pub max_size: u64,
    /// Maximum number of rotated files to keep. 0 means that rotated files are never removed
    /// because of their number.
    pub max_backups: usize,
    /// Rotated files last modified longer ago than this are removed. Zero duration means that
    /// rotated files are never removed because of their age.
    pub max_age: Duration,
    /// If `true`, rotated files are compressed with gzip.
    pub compress: bool,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self {
            max_size: 100 * 1024 * 1024,
            max_backups: 5,
            max_age: Duration::from_secs(30 * 24 * 60 * 60),
            compress: true,
        }
    }
}

#[derive(Debug)]
struct LiveFile {
    file: File,
    size: u64,
}

impl LiveFile {
    fn open(path: &Path) -> io::Result<Self> {
        let file = open_log_file(path)?;
        let size = file.metadata()?.len();
        Ok(Self { file, size })
    }

    /// Appends a complete line. If the write fails midway, the partial line is removed again.
    fn append(&mut self, buf: &[u8]) -> io::Result<()> {
        let (written, result) = write_fully(&mut self.file, buf);
        if let Err(err) = result {
            if written > 0 {
                match discard_partial(&self.file, written) {
                    Ok(size) => self.size = size,
                    Err(truncate_err) => {
                        warn!("Failed removing partial log line: {truncate_err}");
                        self.size += written as u64;
                    }
                }
            }
            return Err(err);
        }

        self.size += buf.len() as u64;
        Ok(())
    }
}

/// Progress of a rotation, a retry continues where the failed attempt stopped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum RotationStep {
    #[default]
    Idle,
    /// Rotated files have been shifted, number 1 is free.
    Shifted,
    /// The live file has been moved to number 1 and is still open.
    Renamed,
}

/// Rotated files of a log file, shared with the background processing after a rotation
#[derive(Debug)]
struct Backups {
    files: LogFileSet,
    policy: RotationPolicy,
    step: Mutex<RotationStep>,
}

impl Backups {
    /// Renames each rotated file `n` into `n + 1`, starting with the oldest. Files that would
    /// exceed the backup count are removed instead.
    fn shift(&self) -> io::Result<()> {
        for file in self.files.rotated_files()?.into_iter().rev() {
            let index = file.index.saturating_add(1);
            if self.policy.max_backups > 0 && index as usize > self.policy.max_backups {
                remove(&file.path)?;
            } else {
                fs::rename(&file.path, self.files.rotated_path(index, file.compressed))?;
            }
        }
        Ok(())
    }

    /// Compresses rotated files and removes expired ones. Nothing is done while a rotation is
    /// unfinished, the live file might still be written to under its rotated name then.
    fn process(&self) {
        let step = self.step.lock();
        if *step != RotationStep::Idle {
            return;
        }

        if self.policy.compress {
            if let Err(err) = self.compress() {
                warn!(
                    "Failed compressing rotated log files for {}: {err}",
                    self.files.live().display()
                );
            }
        }

        if let Err(err) = self.remove_expired() {
            warn!(
                "Failed removing expired log files for {}: {err}",
                self.files.live().display()
            );
        }
    }

    fn compress(&self) -> io::Result<()> {
        for file in self.files.rotated_files()? {
            if file.compressed || self.files.rotated_path(file.index, true).exists() {
                continue;
            }

            match compress(&file.path) {
                Ok(()) => debug!("Compressed rotated log file {}", file.path.display()),
                Err(err) => warn!(
                    "Failed compressing rotated log file {}: {err}",
                    file.path.display()
                ),
            }
        }
        Ok(())
    }

    fn remove_expired(&self) -> io::Result<()> {
        if self.policy.max_age.is_zero() {
            return Ok(());
        }

        let Some(cutoff) = SystemTime::now().checked_sub(self.policy.max_age) else {
            return Ok(());
        };
        for RotatedFile { path, .. } in self.files.rotated_files()? {
            let modified = match fs::metadata(&path).and_then(|meta| meta.modified()) {
                Ok(modified) => modified,
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err),
            };
            if modified < cutoff {
                remove(&path)?;
                debug!("Removed expired log file {}", path.display());
            }
        }
        Ok(())
    }
}

/// Append-only log file rotated according to a [`RotationPolicy`]
///
/// Rotation moves the live file to `<name>.1.<ext>`, shifting older rotated files up by one.
/// Writes and rotations are serialized, so a line always ends up complete in exactly one file.
/// Compressing rotated files and removing expired ones happens on a background thread when
/// rotation is triggered by a write.
#[derive(Debug)]
pub struct RotatingFile {
    backups: Arc<Backups>,
    live: Mutex<LiveFile>,
}

impl RotatingFile {
    /// Opens the log file for appending, creating it if necessary.
    pub fn open(path: impl Into<PathBuf>, policy: RotationPolicy) -> io::Result<Self> {
        let files = LogFileSet::new(path);
        let live = LiveFile::open(files.live())?;
        debug!(
            "Opened log file {} with {} bytes",
            files.live().display(),
            live.size
        );

        Ok(Self {
            backups: Arc::new(Backups {
                files,
                policy,
                step: Mutex::new(RotationStep::Idle),
            }),
            live: Mutex::new(live),
        })
    }

    /// Path of the live log file
    pub fn path(&self) -> &Path {
        self.backups.files.live()
    }

    /// Closes and re-opens the live file, e.g. after it has been moved by an external tool.
    pub fn reopen(&self) -> io::Result<()> {
        let mut live = self.live.lock();
        *live = LiveFile::open(self.path())?;

        // Only background processing can hold the lock here, it never runs mid-rotation
        if let Some(mut step) = self.backups.step.try_lock() {
            if *step == RotationStep::Renamed {
                *step = RotationStep::Idle;
            }
        }

        debug!("Re-opened log file {}", self.path().display());
        Ok(())
    }

    /// Rotates the log file regardless of its size. Rotated files are compressed and expired
    /// ones removed before this returns.
    pub fn rotate(&self) -> io::Result<()> {
        {
            let mut step = self.backups.step.lock();
            let mut live = self.live.lock();
            self.rotate_locked(&mut live, &mut step)?;
        }
        self.backups.process();
        Ok(())
    }

    fn needs_rotation(&self, live: &LiveFile, len: u64) -> bool {
        let max_size = self.backups.policy.max_size;
        max_size > 0 && live.size > 0 && live.size + len > max_size
    }

    fn rotate_locked(&self, live: &mut LiveFile, step: &mut RotationStep) -> io::Result<()> {
        let files = &self.backups.files;

        if *step == RotationStep::Idle {
            self.backups.shift()?;
            *step = RotationStep::Shifted;
        }

        if *step == RotationStep::Shifted {
            match fs::rename(files.live(), files.rotated_path(1, false)) {
                Ok(()) => {}
                // Moved away by someone else, keep rotating into a fresh file
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err),
            }
            *step = RotationStep::Renamed;
        }

        // Until this succeeds, writes continue to go into the rotated file
        *live = LiveFile::open(files.live())?;
        *step = RotationStep::Idle;
        debug!("Rotated log file {}", files.live().display());
        Ok(())
    }

    fn spawn_processing(&self) {
        let policy = &self.backups.policy;
        if !policy.compress && policy.max_age.is_zero() {
            return;
        }

        let backups = Arc::clone(&self.backups);
        if let Err(err) = thread::Builder::new()
            .name("log-rotation".to_owned())
            .spawn(move || backups.process())
        {
            warn!(
                "Failed processing rotated log files for {}: {err}",
                self.path().display()
            );
        }
    }
}

impl LineSink for RotatingFile {
    fn write_line(&self, line: &str) -> io::Result<()> {
        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');

        let mut live = self.live.lock();
        let mut rotated = false;
        if self.needs_rotation(&live, buf.len() as u64) {
            // If rotated files are still being processed, the line goes into the old file and
            // rotation is retried on the next write. Same if rotation fails.
            match self.backups.step.try_lock() {
                Some(mut step) => match self.rotate_locked(&mut live, &mut step) {
                    Ok(()) => rotated = true,
                    Err(err) => error!("Failed rotating log file {}: {err}", self.path().display()),
                },
                None => debug!(
                    "Postponed rotating log file {}, rotated files are being processed",
                    self.path().display()
                ),
            }
        }

        let result = live.append(&buf);
        drop(live);

        if rotated {
            self.spawn_processing();
        }
        result
    }
}

/// Writes all of `buf`, returning the number of bytes written along with the result.
fn write_fully(out: &mut impl Write, buf: &[u8]) -> (usize, io::Result<()>) {
    let mut written = 0;
    while written < buf.len() {
        match out.write(&buf[written..]) {
            Ok(0) => return (written, Err(io::ErrorKind::WriteZero.into())),
            Ok(count) => written += count,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return (written, Err(err)),
        }
    }
    (written, Ok(()))
}

/// Truncates the last `written` bytes of the file, returning its new size.
fn discard_partial(file: &File, written: usize) -> io::Result<u64> {
    let size = file.metadata()?.len().saturating_sub(written as u64);
    file.set_len(size)?;
    Ok(size)
}

fn remove(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

fn write_compressed(path: &Path, target: &Path) -> io::Result<()> {
    let mut input = BufReader::new(File::open(path)?);
    let mut encoder = GzEncoder::new(create_log_file(target)?, Compression::default());
    io::copy(&mut input, &mut encoder)?;
    encoder.finish()?.sync_all()
}

/// Compresses a file into `<path>.gz` and removes the original.
fn compress(path: &Path) -> io::Result<()> {
    let mut target = path.as_os_str().to_owned();
    target.push(COMPRESSED_SUFFIX);
    let target = PathBuf::from(target);

    match write_compressed(path, &target) {
        Ok(()) => fs::remove_file(path),
        Err(err) => {
            // Keep the uncompressed file, a partial archive is useless
            let _ = fs::remove_file(&target);
            Err(err)
        }
    }
}
