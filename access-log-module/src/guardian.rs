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

//! Enforcing restrictive permissions on log files
//!
//! Log files are readable by the owner and the group only (`0640`), the directory created for
//! them is accessible by the owner and the group only (`0750`). On platforms without Unix
//! permissions only the existence of files and directories is ensured.

use log::{debug, error, trace, warn};
use std::fs::{self, DirBuilder, File, Metadata, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::{self, JoinHandle};
use tokio::time::{self, MissedTickBehavior};

#[cfg(unix)]
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};

use crate::error::Error;
use crate::file_set::LogFileSet;

/// Permissions of log files: owner read/write, group read, no access for others
pub const LOG_FILE_MODE: u32 = 0o640;

/// Permissions of the log directory: owner full access, group read/execute, no access for others
pub const LOG_DIR_MODE: u32 = 0o750;

#[cfg(unix)]
fn has_mode(meta: &Metadata, mode: u32) -> bool {
    meta.permissions().mode() & 0o777 == mode
}

#[cfg(not(unix))]
fn has_mode(_meta: &Metadata, _mode: u32) -> bool {
    true
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

fn open_secured(options: &mut OpenOptions, path: &Path) -> io::Result<File> {
    #[cfg(unix)]
    options.mode(LOG_FILE_MODE);

    let file = options.open(path)?;

    // The mode passed to open() is subject to umask and ignored for existing files
    #[cfg(unix)]
    if !has_mode(&file.metadata()?, LOG_FILE_MODE) {
        file.set_permissions(fs::Permissions::from_mode(LOG_FILE_MODE))?;
    }

    Ok(file)
}

/// Opens a log file for appending, creating it if necessary. The file will have restrictive
/// permissions afterwards.
pub(crate) fn open_log_file(path: &Path) -> io::Result<File> {
    open_secured(OpenOptions::new().append(true).create(true), path)
}

/// Creates an empty log file with restrictive permissions, truncating existing files.
pub(crate) fn create_log_file(path: &Path) -> io::Result<File> {
    open_secured(
        OpenOptions::new().write(true).create(true).truncate(true),
        path,
    )
}

fn fix_permissions(path: &Path, meta: &Metadata) -> Result<(), Error> {
    if !has_mode(meta, LOG_FILE_MODE) {
        set_mode(path, LOG_FILE_MODE).map_err(|source| Error::SetPermissions {
            path: path.to_owned(),
            source,
        })?;
        debug!("Corrected permissions of log file {}", path.display());
    }
    Ok(())
}

/// Makes sure that the live log file exists and has restrictive permissions.
///
/// The parent directory is created with restrictive permissions if it doesn’t exist. A missing
/// log file is created empty, an existing one keeps its contents but has its permissions
/// corrected if necessary. Calling this repeatedly is safe, also while the file is open.
pub fn secure_live_file(path: &Path) -> Result<(), Error> {
    if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        if !dir.is_dir() {
            let mut builder = DirBuilder::new();
            builder.recursive(true);
            #[cfg(unix)]
            builder.mode(LOG_DIR_MODE);

            builder
                .create(dir)
                .map_err(|source| Error::CreateDirectory {
                    path: dir.to_owned(),
                    source,
                })?;
            set_mode(dir, LOG_DIR_MODE).map_err(|source| Error::SetPermissions {
                path: dir.to_owned(),
                source,
            })?;
            debug!("Created log directory {}", dir.display());
        }
    }

    match fs::metadata(path) {
        Ok(meta) => fix_permissions(path, &meta),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            open_log_file(path).map_err(|source| Error::OpenFile {
                path: path.to_owned(),
                source,
            })?;
            debug!("Created log file {}", path.display());
            Ok(())
        }
        Err(source) => Err(Error::Inspect {
            path: path.to_owned(),
            source,
        }),
    }
}

/// Secures a single member of the log file set. Symbolic links and other special files are
/// left alone, files that disappeared in the meantime are skipped.
fn secure_candidate(path: &Path) -> Result<(), Error> {
    let result = fs::symlink_metadata(path)
        .map_err(|source| Error::Inspect {
            path: path.to_owned(),
            source,
        })
        .and_then(|meta| {
            if meta.is_file() {
                fix_permissions(path, &meta)
            } else {
                trace!("Not a regular file, skipping: {}", path.display());
                Ok(())
            }
        });

    match result {
        Err(err) if err.is_not_found() => {
            trace!("Log file {} disappeared, skipping", path.display());
            Ok(())
        }
        result => result,
    }
}

/// Secures each of the candidates, continuing after failures. Errors for individual files are
/// added to `errors`, which are then reported together as [`Error::Incomplete`].
fn secure_candidates(
    candidates: impl IntoIterator<Item = PathBuf>,
    mut errors: Vec<Error>,
) -> Result<(), Error> {
    for path in candidates {
        if let Err(err) = secure_candidate(&path) {
            errors.push(err);
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(Error::Incomplete(errors))
    }
}

/// Corrects the permissions of the live log file and all of its rotated siblings.
///
/// Files removed by a concurrent rotation are skipped. Failures for individual files don’t stop
/// processing of the others, these are reported together as [`Error::Incomplete`].
pub fn secure_rotated_files(path: &Path) -> Result<(), Error> {
    let set = LogFileSet::new(path);
    let entries = fs::read_dir(set.dir()).map_err(|source| Error::ListDirectory {
        path: set.dir().to_owned(),
        source,
    })?;

    let mut candidates = Vec::new();
    let mut errors = Vec::new();
    for entry in entries {
        match entry {
            Ok(entry) => {
                if entry
                    .file_name()
                    .to_str()
                    .is_some_and(|name| set.contains(name))
                {
                    candidates.push(entry.path());
                }
            }
            Err(source) => errors.push(Error::ListDirectory {
                path: set.dir().to_owned(),
                source,
            }),
        }
    }

    secure_candidates(candidates, errors)
}

async fn secure_pass(path: &Path) {
    let path = path.to_owned();
    match task::spawn_blocking(move || secure_rotated_files(&path)).await {
        Ok(Ok(())) => trace!("Log file permissions checked"),
        Ok(Err(err)) => warn!("{err}"),
        Err(err) => error!("Log file permission check crashed: {err}"),
    }
}

/// Background task periodically correcting the permissions of the log files
///
/// The first check happens right after the task is spawned. Dropping this handle stops the task
/// as well, [`PermissionGuardian::shutdown`] additionally waits for it to finish.
#[derive(Debug)]
pub struct PermissionGuardian {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl PermissionGuardian {
    /// Starts the periodic task for the log file at `path`. This must be called from within a
    /// Tokio runtime.
    pub fn spawn(path: impl Into<PathBuf>, interval: Duration) -> Self {
        let path = path.into();
        let interval = interval.max(Duration::from_millis(1));
        let (shutdown, mut receiver) = oneshot::channel();

        let task = tokio::spawn(async move {
            let mut ticks = time::interval(interval);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                // A pass that started always completes, shutdown is only checked between passes
                tokio::select! {
                    _ = &mut receiver => break,
                    _ = ticks.tick() => secure_pass(&path).await,
                }
            }
            debug!("Stopped securing log files at {}", path.display());
        });

        Self { shutdown, task }
    }

    /// Stops the periodic task and waits for a check in progress to complete.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        if let Err(err) = self.task.await {
            error!("Log file permission task failed: {err}");
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    use std::os::unix::fs::symlink;
    use std::time::Instant;
    use test_log::test;

    fn mode(path: &Path) -> u32 {
        fs::symlink_metadata(path).unwrap().permissions().mode() & 0o777
    }

    fn create_with_mode(path: &Path, mode: u32) {
        fs::write(path, "data\n").unwrap();
        fs::set_permissions(path, fs::Permissions::from_mode(mode)).unwrap();
    }

    #[test]
    fn live_file_creation() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().join("logs");
        let path = log_dir.join("access.log");

        secure_live_file(&path).unwrap();
        assert_eq!(mode(&log_dir), LOG_DIR_MODE);
        assert_eq!(mode(&path), LOG_FILE_MODE);
        assert_eq!(fs::read(&path).unwrap(), b"");

        // Idempotent, keeps existing data
        fs::write(&path, "line\n").unwrap();
        secure_live_file(&path).unwrap();
        assert_eq!(mode(&path), LOG_FILE_MODE);
        assert_eq!(fs::read(&path).unwrap(), b"line\n");
    }

    #[test]
    fn live_file_correction() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");
        create_with_mode(&path, 0o666);

        secure_live_file(&path).unwrap();
        assert_eq!(mode(&path), LOG_FILE_MODE);
        assert_eq!(fs::read(&path).unwrap(), b"data\n");
    }

    #[test]
    fn rotated_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");
        create_with_mode(&path, 0o644);
        create_with_mode(&dir.path().join("access.1.log"), 0o600);
        create_with_mode(&dir.path().join("access.2.log.gz"), 0o644);
        create_with_mode(&dir.path().join("access.3.log.gz"), 0o640);
        create_with_mode(&dir.path().join("error.log"), 0o644);
        create_with_mode(&dir.path().join("access.log.bak"), 0o644);

        secure_rotated_files(&path).unwrap();
        assert_eq!(mode(&path), LOG_FILE_MODE);
        assert_eq!(mode(&dir.path().join("access.1.log")), LOG_FILE_MODE);
        assert_eq!(mode(&dir.path().join("access.2.log.gz")), LOG_FILE_MODE);
        assert_eq!(mode(&dir.path().join("access.3.log.gz")), LOG_FILE_MODE);
        assert_eq!(mode(&dir.path().join("error.log")), 0o644);
        assert_eq!(mode(&dir.path().join("access.log.bak")), 0o644);
    }

    #[test]
    fn vanished_files() {
        let dir = tempfile::tempdir().unwrap();
        assert!(secure_candidate(&dir.path().join("access.1.log")).is_ok());

        let err = secure_rotated_files(&dir.path().join("missing").join("access.log"));
        assert!(matches!(err, Err(Error::ListDirectory { .. })));
    }

    #[test]
    fn partial_failure() {
        let dir = tempfile::tempdir().unwrap();
        let live = dir.path().join("access.log");
        let rotated = dir.path().join("access.2.log");
        create_with_mode(&live, 0o644);
        create_with_mode(&rotated, 0o600);

        // Inspecting a path below a regular file fails with something other than NotFound
        let not_a_dir = dir.path().join("access.1.log");
        create_with_mode(&not_a_dir, 0o640);
        let broken = not_a_dir.join("access.1.log");

        // Listed, then removed by a concurrent rotation
        let vanished = dir.path().join("access.3.log");
        create_with_mode(&vanished, 0o644);
        fs::remove_file(&vanished).unwrap();

        let candidates = vec![
            vanished.clone(),
            live.clone(),
            broken.clone(),
            rotated.clone(),
        ];
        match secure_candidates(candidates, Vec::new()) {
            Err(Error::Incomplete(errors)) => {
                assert_eq!(errors.len(), 1, "{errors:?}");
                assert!(
                    matches!(&errors[0], Error::Inspect { path, .. } if path == &broken),
                    "{errors:?}"
                );
            }
            result => panic!("unexpected result: {result:?}"),
        }

        // Files after the failing one were processed nevertheless
        assert_eq!(mode(&live), LOG_FILE_MODE);
        assert_eq!(mode(&rotated), LOG_FILE_MODE);
        assert!(!vanished.exists());

        // Without failures, vanished files don’t produce an error
        create_with_mode(&rotated, 0o644);
        let candidates = vec![dir.path().join("access.4.log.gz"), rotated.clone()];
        assert!(secure_candidates(candidates, Vec::new()).is_ok());
        assert_eq!(mode(&rotated), LOG_FILE_MODE);
    }

    #[test]
    fn symlinks_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("secret.txt");
        create_with_mode(&target, 0o644);
        symlink(&target, dir.path().join("access.1.log")).unwrap();
        create_with_mode(&dir.path().join("access.2.log"), 0o644);

        secure_rotated_files(&dir.path().join("access.log")).unwrap();
        assert_eq!(mode(&target), 0o644);
        assert_eq!(mode(&dir.path().join("access.2.log")), LOG_FILE_MODE);
    }

    #[test]
    fn created_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.1.log");
        create_with_mode(&path, 0o644);

        let file = create_log_file(&path).unwrap();
        assert_eq!(file.metadata().unwrap().len(), 0);
        assert_eq!(mode(&path), LOG_FILE_MODE);

        let path = dir.path().join("access.log");
        open_log_file(&path).unwrap();
        assert_eq!(mode(&path), LOG_FILE_MODE);
    }

    async fn wait_for_mode(path: &Path, expected: u32) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if mode(path) == expected {
                return true;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[test(tokio::test(flavor = "multi_thread"))]
    async fn periodic_task() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");
        create_with_mode(&path, 0o644);

        let guardian = PermissionGuardian::spawn(&path, Duration::from_millis(20));
        assert!(wait_for_mode(&path, LOG_FILE_MODE).await);

        // Files rotated later are picked up by subsequent passes
        let rotated = dir.path().join("access.1.log");
        create_with_mode(&rotated, 0o644);
        assert!(wait_for_mode(&rotated, LOG_FILE_MODE).await);

        guardian.shutdown().await;

        let rotated = dir.path().join("access.2.log");
        create_with_mode(&rotated, 0o644);
        time::sleep(Duration::from_millis(100)).await;
        assert_eq!(mode(&rotated), 0o644);
    }
}
