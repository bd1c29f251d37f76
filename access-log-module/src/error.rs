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

//! Error type of the access log module

use std::io;
use std::path::PathBuf;

/// Errors produced while setting up access logging or securing log files
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The directory holding the log file could not be created
    #[error("failed creating log directory {}: {source}", .path.display())]
    CreateDirectory {
        /// Directory path
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },

    /// The log file could not be created or opened
    #[error("failed opening log file {}: {source}", .path.display())]
    OpenFile {
        /// File path
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },

    /// File metadata could not be retrieved
    #[error("failed checking log file {}: {source}", .path.display())]
    Inspect {
        /// File path
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },

    /// File permissions could not be changed
    #[error("failed setting permissions of {}: {source}", .path.display())]
    SetPermissions {
        /// File path
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },

    /// The log directory could not be listed
    #[error("failed listing log directory {}: {source}", .path.display())]
    ListDirectory {
        /// Directory path
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },

    /// The configuration file could not be read
    #[error("failed reading configuration file {}: {source}", .path.display())]
    ReadConfiguration {
        /// Configuration file path
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },

    /// Configuration data is invalid
    #[error("invalid configuration: {0}")]
    ParseConfiguration(#[from] serde_yaml::Error),

    /// Some files of a log file set could not be processed, the others were
    #[error("failed securing {} log file(s): {}", .0.len(), summarize(.0))]
    Incomplete(Vec<Error>),
}

impl Error {
    /// Returns `true` if this error was caused by a file or directory that doesn’t exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::CreateDirectory { source, .. }
            | Self::OpenFile { source, .. }
            | Self::Inspect { source, .. }
            | Self::SetPermissions { source, .. }
            | Self::ListDirectory { source, .. }
            | Self::ReadConfiguration { source, .. } => source.kind() == io::ErrorKind::NotFound,
            Self::ParseConfiguration(_) | Self::Incomplete(_) => false,
        }
    }
}

fn summarize(errors: &[Error]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
