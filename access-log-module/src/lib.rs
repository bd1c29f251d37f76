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

//! # Access Log Module
//!
//! This crate implements the creation of access log files in the
//! [Common Log Format](https://en.wikipedia.org/wiki/Common_Log_Format) or the Combined Log
//! Format known from Apache, so that they can be processed further by a variety of tools.
//! A configuration could look like this:
//!
//! ```yaml
//! log_file: /var/log/apache2/access.log
//! log_format: combined
//! log_max_size: 100
//! log_max_backups: 5
//! log_max_age: 30
//! log_compress: true
//! log_secure_interval: 60
//! ```
//!
//! All settings are also available as command line options, e.g. `--log-file`.
//!
//! The supported log formats are:
//!
//! * `common`: `%h %l %u %t "%r" %>s %b`, e.g.
//!   `1.2.3.4 - - [10/Oct/2023:13:55:36 +0000] "GET /api/hello HTTP/1.1" 200 27`
//! * `combined`: `common` followed by the quoted `Referer` and `User-Agent` request headers,
//!   `-` if these are missing
//!
//! This module will add one line per request to the log file. A log file will be created if
//! necessary, data in already existing files will be kept. Special values for `log_file` are an
//! empty string (logging disabled) and `-` (log to standard output).
//!
//! ## Log rotation
//!
//! Once the log file would grow beyond `log_max_size` megabytes it is renamed: `access.log`
//! becomes `access.1.log`, an existing `access.1.log` becomes `access.2.log` and so on. With
//! `log_compress` enabled, rotated files are compressed with gzip, e.g. `access.1.log.gz`.
//! Rotated files beyond `log_max_backups` or older than `log_max_age` days are removed.
//! Compression and removal of expired files run on a background thread, requests don’t wait
//! for them.
//!
//! On Unix-based systems, the process can also be sent a `HUP` or `USR1` signal to make it
//! re-open the log file. This is useful if the logs are rotated by external tools.
//!
//! ## File permissions
//!
//! Log files are restricted to mode `0640` (owner read/write, group read), a log directory
//! created by this module to mode `0750`. The permissions are enforced on startup and then
//! periodically every `log_secure_interval` seconds for the log file and its rotated siblings.
//!
//! ## Code example
//!
//! [`AccessLogHandler`] wraps the handler producing the actual response and logs each request
//! once the wrapped handler is done.
//!
//! ```rust,no_run
//! use access_log_module::{
//!     AccessLogConf, AccessLogHandler, AccessLogOpt, FromYaml, Handler, HandlerError,
//!     ResponseWriter,
//! };
//! use async_trait::async_trait;
//! use bytes::Bytes;
//! use clap::Parser;
//! use http::Request;
//!
//! #[derive(Debug)]
//! struct Hello;
//!
//! #[async_trait]
//! impl Handler for Hello {
//!     async fn handle(
//!         &self,
//!         _request: &Request<Bytes>,
//!         response: &mut impl ResponseWriter,
//!     ) -> Result<(), HandlerError> {
//!         response.write_body(b"Hello, World!").await?;
//!         Ok(())
//!     }
//! }
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let opt = AccessLogOpt::parse();
//! let mut conf = AccessLogConf::load_from_yaml("access-log.yaml")?;
//! conf.merge_with_opt(opt);
//!
//! let handler = AccessLogHandler::from_conf(Hello, &conf)?;
//! let maintenance = handler.spawn_maintenance(conf.secure_interval());
//!
//! // Pass requests to handler.handle() here
//!
//! maintenance.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod configuration;
mod error;
mod file_set;
mod format;
mod guardian;
mod handler;
mod observer;
#[cfg(unix)]
mod signal;
mod writer;

pub use configuration::{AccessLogConf, AccessLogOpt, FromYaml, LogFormatKind};
pub use error::Error;
pub use file_set::{LogFileSet, RotatedFile};
pub use format::{format_line, ClientAddr, RequestObservation};
pub use guardian::{
    secure_live_file, secure_rotated_files, PermissionGuardian, LOG_DIR_MODE, LOG_FILE_MODE,
};
pub use handler::{AccessLogHandler, Handler, HandlerError, Maintenance};
pub use observer::{ResponseObservation, ResponseObserver, ResponseWriter};
pub use writer::{LineSink, RotatingFile, RotationPolicy, StdoutSink};
