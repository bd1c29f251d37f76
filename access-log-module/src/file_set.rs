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

//! Naming scheme of the live log file and its rotated siblings
//!
//! For a live file `logs/access.log`, rotated files are named `logs/access.1.log`,
//! `logs/access.2.log` and so on, the lowest number being the most recent one. Compressed
//! rotated files get an additional `.gz` suffix: `logs/access.1.log.gz`. Without an extension
//! the live file `logs/access` rotates into `logs/access.1` and `logs/access.1.gz`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// File name suffix of compressed rotated files
pub(crate) const COMPRESSED_SUFFIX: &str = ".gz";

/// A rotated log file found on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotatedFile {
    /// Full path of the file
    pub path: PathBuf,
    /// Rotation number, 1 for the most recent backup
    pub index: u32,
    /// Whether the file has been compressed
    pub compressed: bool,
}

/// The live log file and the rules for naming its rotated siblings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFileSet {
    live: PathBuf,
    dir: PathBuf,
    base: String,
    ext: String,
}

impl LogFileSet {
    /// Derives the file set from the path of the live log file.
    pub fn new(live: impl Into<PathBuf>) -> Self {
        let live = live.into();
        let dir = match live.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_owned(),
            _ => PathBuf::from("."),
        };
        let base = live
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
        let ext = live
            .extension()
            .map(|ext| format!(".{}", ext.to_string_lossy()))
            .unwrap_or_default();

        Self {
            live,
            dir,
            base,
            ext,
        }
    }

    /// Path of the live log file
    pub fn live(&self) -> &Path {
        &self.live
    }

    /// Directory containing the live log file and its rotated siblings
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the rotated file with the given number
    pub fn rotated_path(&self, index: u32, compressed: bool) -> PathBuf {
        let suffix = if compressed { COMPRESSED_SUFFIX } else { "" };
        self.dir
            .join(format!("{}.{index}{}{suffix}", self.base, self.ext))
    }

    /// Checks whether a file name belongs to a rotated sibling, returning its number and
    /// whether it is compressed.
    pub fn parse_rotated(&self, file_name: &str) -> Option<(u32, bool)> {
        let rest = file_name.strip_prefix(&self.base)?.strip_prefix('.')?;

        if let Some(index) = rest
            .strip_suffix(COMPRESSED_SUFFIX)
            .and_then(|rest| self.parse_index(rest))
        {
            return Some((index, true));
        }
        self.parse_index(rest).map(|index| (index, false))
    }

    fn parse_index(&self, rest: &str) -> Option<u32> {
        let digits = rest.strip_suffix(self.ext.as_str())?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok()
    }

    /// Checks whether a file name is either the live log file or one of its rotated siblings.
    pub fn contains(&self, file_name: &str) -> bool {
        self.live
            .file_name()
            .is_some_and(|live| live.to_str() == Some(file_name))
            || self.parse_rotated(file_name).is_some()
    }

    /// Lists the rotated files currently present, most recent first.
    pub fn rotated_files(&self) -> io::Result<Vec<RotatedFile>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some((index, compressed)) = self.parse_rotated(name) {
                files.push(RotatedFile {
                    path: entry.path(),
                    index,
                    compressed,
                });
            }
        }
        files.sort_by_key(|file| (file.index, file.compressed));
        Ok(files)
    }
}
