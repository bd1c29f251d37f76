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

//! Request handler decorator writing one access log line per request

use async_trait::async_trait;
use bytes::Bytes;
use futures::FutureExt;
use http::Request;
use log::{trace, warn};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

use crate::configuration::{AccessLogConf, LogFormatKind};
use crate::error::Error;
use crate::format::RequestObservation;
use crate::guardian::{secure_live_file, PermissionGuardian};
use crate::observer::{ResponseObserver, ResponseWriter};
use crate::writer::{LineSink, RotatingFile, StdoutSink};

/// Error type returned by request handlers
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Trait to be implemented by request handlers.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Handles a request, writing the response into `response`.
    async fn handle(
        &self,
        request: &Request<Bytes>,
        response: &mut impl ResponseWriter,
    ) -> Result<(), HandlerError>;
}

fn normalize_path(path: &Path) -> Result<PathBuf, Error> {
    if let Some(parent) = path.parent() {
        let parent = if parent.as_os_str().is_empty() {
            Path::new(".")
        } else {
            parent
        };
        let mut normalized = parent.canonicalize().map_err(|source| Error::Inspect {
            path: parent.to_owned(),
            source,
        })?;
        if let Some(name) = path.file_name() {
            normalized.push(name);
        }
        Ok(normalized)
    } else {
        // Absolute path in the root, leave unchanged
        Ok(path.to_owned())
    }
}

/// Handler decorator logging each request passing through it
///
/// One log line is written for every request where control returns to this handler: after the
/// wrapped handler succeeded, failed or panicked (provided that panics unwind). Errors and
/// panics are passed on unchanged. Failures to write the log line are only reported via the
/// `log` crate, they never affect the response.
#[derive(Debug)]
pub struct AccessLogHandler<H> {
    next: H,
    sink: Option<Arc<dyn LineSink>>,
    log_file: Option<Arc<RotatingFile>>,
    format: LogFormatKind,
}

impl<H> AccessLogHandler<H> {
    /// Wraps `next`, writing log lines in the given format to `sink`.
    pub fn new(next: H, sink: Arc<dyn LineSink>, format: LogFormatKind) -> Self {
        Self {
            next,
            sink: Some(sink),
            log_file: None,
            format,
        }
    }

    /// Wraps `next` without logging anything.
    pub fn disabled(next: H) -> Self {
        Self {
            next,
            sink: None,
            log_file: None,
            format: LogFormatKind::default(),
        }
    }

    /// Wraps `next` with logging set up according to the configuration.
    ///
    /// An empty log file path disables logging, `-` writes log lines to standard output. Any
    /// other path is secured with [`secure_live_file`] and opened as a [`RotatingFile`].
    pub fn from_conf(next: H, conf: &AccessLogConf) -> Result<Self, Error> {
        let path = conf.log_file.as_path();
        if path.as_os_str().is_empty() {
            return Ok(Self::disabled(next));
        }
        if path.as_os_str() == "-" {
            return Ok(Self::new(next, Arc::new(StdoutSink), conf.log_format));
        }

        secure_live_file(path)?;
        // Normalize parent directory in case the process changes its working directory later
        let path = normalize_path(path)?;
        let file = RotatingFile::open(&path, conf.rotation_policy())
            .map_err(|source| Error::OpenFile { path, source })?;

        let file = Arc::new(file);
        let sink: Arc<dyn LineSink> = file.clone();
        Ok(Self {
            next,
            sink: Some(sink),
            log_file: Some(file),
            format: conf.log_format,
        })
    }

    /// The log file written to, if this handler was configured with one
    pub fn log_file(&self) -> Option<&Arc<RotatingFile>> {
        self.log_file.as_ref()
    }

    /// Starts the background tasks for the log file: periodic permission checks and, on Unix,
    /// re-opening the log file on `HUP` or `USR1` signals. Nothing is started if this handler
    /// doesn’t write to a log file. This must be called from within a Tokio runtime.
    pub fn spawn_maintenance(&self, interval: Duration) -> Maintenance {
        let Some(file) = &self.log_file else {
            return Maintenance::default();
        };

        Maintenance {
            guardian: Some(PermissionGuardian::spawn(file.path(), interval)),
            #[cfg(unix)]
            signals: crate::signal::listen(file),
            #[cfg(not(unix))]
            signals: Vec::new(),
        }
    }
}

#[async_trait]
impl<H: Handler> Handler for AccessLogHandler<H> {
    async fn handle(
        &self,
        request: &Request<Bytes>,
        response: &mut impl ResponseWriter,
    ) -> Result<(), HandlerError> {
        let Some(sink) = &self.sink else {
            // Logging disabled
            return self.next.handle(request, response).await;
        };

        let started = Instant::now();
        let observation = RequestObservation::now(request);
        let mut observer = ResponseObserver::new(response);

        let result = AssertUnwindSafe(self.next.handle(request, &mut observer))
            .catch_unwind()
            .await;

        let line = self.format.render(&observation, &observer.observation());
        trace!("Processed request in {:?}: {line}", started.elapsed());
        if let Err(err) = sink.write_line(&line) {
            warn!("Failed writing access log line: {err}");
        }

        match result {
            Ok(result) => result,
            Err(payload) => panic::resume_unwind(payload),
        }
    }
}

/// Background tasks started by [`AccessLogHandler::spawn_maintenance`]
///
/// Dropping this stops the permission checks, signal listeners keep running then.
#[derive(Debug, Default)]
pub struct Maintenance {
    guardian: Option<PermissionGuardian>,
    signals: Vec<JoinHandle<()>>,
}

impl Maintenance {
    /// Stops all background tasks, waiting for a permission check in progress to complete.
    pub async fn shutdown(self) {
        for signal in self.signals {
            signal.abort();
        }
        if let Some(guardian) = self.guardian {
            guardian.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::format::ClientAddr;
    use crate::observer::tests::TestWriter;
    use http::{header, StatusCode};
    use parking_lot::Mutex;
    use std::env::current_dir;
    use std::fs;
    use std::io;
    use test_log::test;

    #[derive(Debug, Default)]
    struct MemorySink(Mutex<Vec<String>>);

    impl MemorySink {
        fn lines(&self) -> Vec<String> {
            self.0.lock().clone()
        }
    }

    impl LineSink for MemorySink {
        fn write_line(&self, line: &str) -> io::Result<()> {
            self.0.lock().push(line.to_owned());
            Ok(())
        }
    }

    #[derive(Debug)]
    struct FailingSink;

    impl LineSink for FailingSink {
        fn write_line(&self, _line: &str) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::Other, "disk full"))
        }
    }

    #[derive(Debug)]
    enum TestHandler {
        Hello,
        NotFound,
        Failing,
        Panicking,
    }

    #[async_trait]
    impl Handler for TestHandler {
        async fn handle(
            &self,
            _request: &Request<Bytes>,
            response: &mut impl ResponseWriter,
        ) -> Result<(), HandlerError> {
            match self {
                Self::Hello => {
                    response
                        .headers_mut()
                        .insert(header::CONTENT_TYPE, "application/json".try_into()?);
                    response
                        .write_body(br#"{"message": "Hello, World!"}"#)
                        .await?;
                    Ok(())
                }
                Self::NotFound => {
                    response.set_status(StatusCode::NOT_FOUND);
                    response.write_body(b"not found").await?;
                    Ok(())
                }
                Self::Failing => {
                    response.set_status(StatusCode::BAD_GATEWAY);
                    Err("upstream unavailable".into())
                }
                Self::Panicking => panic!("handler bug"),
            }
        }
    }

    fn make_request(path: &str) -> Request<Bytes> {
        Request::get(path)
            .header(header::USER_AGENT, "curl/8.0")
            .extension(ClientAddr("1.2.3.4:51234".parse().unwrap()))
            .body(Bytes::new())
            .unwrap()
    }

    fn make_handler(
        next: TestHandler,
        format: LogFormatKind,
    ) -> (AccessLogHandler<TestHandler>, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::default());
        (AccessLogHandler::new(next, sink.clone(), format), sink)
    }

    fn assert_line(line: &str, prefix: &str, suffix: &str) {
        assert!(line.starts_with(prefix), "unexpected line: {line}");
        assert!(line.ends_with(suffix), "unexpected line: {line}");
    }

    #[test(tokio::test)]
    async fn default_status() -> Result<(), HandlerError> {
        let (handler, sink) = make_handler(TestHandler::Hello, LogFormatKind::Common);
        let mut writer = TestWriter::default();
        handler
            .handle(&make_request("/api/hello"), &mut writer)
            .await?;

        assert_eq!(writer.body, br#"{"message": "Hello, World!"}"#);
        assert_eq!(writer.headers[header::CONTENT_TYPE], "application/json");
        assert!(writer.statuses.is_empty());

        let lines = sink.lines();
        assert_eq!(lines.len(), 1);
        assert_line(
            &lines[0],
            "1.2.3.4 - - [",
            r#"] "GET /api/hello HTTP/1.1" 200 28"#,
        );
        Ok(())
    }

    #[test(tokio::test)]
    async fn combined_format() -> Result<(), HandlerError> {
        let (handler, sink) = make_handler(TestHandler::NotFound, LogFormatKind::Combined);
        let mut writer = TestWriter::default();
        handler
            .handle(&make_request("/missing?q=1"), &mut writer)
            .await?;

        assert_eq!(writer.statuses, vec![StatusCode::NOT_FOUND]);
        assert_line(
            &sink.lines()[0],
            "1.2.3.4 - - [",
            r#"] "GET /missing?q=1 HTTP/1.1" 404 9 "-" "curl/8.0""#,
        );
        Ok(())
    }

    #[test(tokio::test)]
    async fn handler_error() {
        let (handler, sink) = make_handler(TestHandler::Failing, LogFormatKind::Common);
        let err = handler
            .handle(&make_request("/"), &mut TestWriter::default())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "upstream unavailable");

        let lines = sink.lines();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].ends_with(r#""GET / HTTP/1.1" 502 0"#));
    }

    #[test(tokio::test)]
    async fn handler_panic() {
        let (handler, sink) = make_handler(TestHandler::Panicking, LogFormatKind::Common);
        let mut writer = TestWriter::default();
        let result = AssertUnwindSafe(handler.handle(&make_request("/"), &mut writer))
            .catch_unwind()
            .await;
        assert!(result.is_err());

        let lines = sink.lines();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].ends_with(r#""GET / HTTP/1.1" 200 0"#));
    }

    #[test(tokio::test)]
    async fn failed_log_write() -> Result<(), HandlerError> {
        let handler = AccessLogHandler::new(
            TestHandler::Hello,
            Arc::new(FailingSink),
            LogFormatKind::Common,
        );
        let mut writer = TestWriter::default();
        handler.handle(&make_request("/"), &mut writer).await?;
        assert_eq!(writer.body.len(), 28);
        Ok(())
    }

    #[test(tokio::test)]
    async fn disabled() -> Result<(), HandlerError> {
        let handler = AccessLogHandler::from_conf(
            TestHandler::Hello,
            &AccessLogConf {
                log_file: PathBuf::new(),
                ..Default::default()
            },
        )?;
        assert!(handler.log_file().is_none());

        let mut writer = TestWriter::default();
        handler.handle(&make_request("/"), &mut writer).await?;
        assert_eq!(writer.body.len(), 28);

        let maintenance = handler.spawn_maintenance(Duration::from_secs(1));
        maintenance.shutdown().await;
        Ok(())
    }

    #[test(tokio::test)]
    async fn stdout() -> Result<(), HandlerError> {
        let handler = AccessLogHandler::from_conf(
            TestHandler::Hello,
            &AccessLogConf {
                log_file: PathBuf::from("-"),
                ..Default::default()
            },
        )?;
        assert!(handler.log_file().is_none());
        handler
            .handle(&make_request("/"), &mut TestWriter::default())
            .await?;
        Ok(())
    }

    #[test(tokio::test(flavor = "multi_thread"))]
    async fn log_file() -> Result<(), HandlerError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("logs").join("access.log");
        let handler = Arc::new(AccessLogHandler::from_conf(
            TestHandler::Hello,
            &AccessLogConf {
                log_file: path.clone(),
                log_format: LogFormatKind::Combined,
                ..Default::default()
            },
        )?);
        assert_eq!(
            handler.log_file().map(|file| file.path().to_owned()),
            Some(path.canonicalize()?)
        );

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            assert_eq!(fs::metadata(&path)?.permissions().mode() & 0o777, 0o640);
        }

        let maintenance = handler.spawn_maintenance(Duration::from_secs(60));

        let tasks: Vec<_> = (0..50)
            .map(|i| {
                let handler = handler.clone();
                tokio::spawn(async move {
                    let mut writer = TestWriter::default();
                    handler
                        .handle(&make_request(&format!("/request/{i}")), &mut writer)
                        .await
                        .map_err(|err| err.to_string())
                })
            })
            .collect();
        for task in tasks {
            task.await??;
        }

        maintenance.shutdown().await;

        let data = fs::read_to_string(&path)?;
        let mut targets: Vec<_> = data
            .lines()
            .map(|line| {
                assert!(line.ends_with(r#" 200 28 "-" "curl/8.0""#), "unexpected line: {line}");
                line.split(' ').nth(6).unwrap_or_default().to_owned()
            })
            .collect();
        targets.sort();
        let mut expected: Vec<_> = (0..50).map(|i| format!("/request/{i}")).collect();
        expected.sort();
        assert_eq!(targets, expected);
        Ok(())
    }

    #[test]
    fn path_normalization() {
        let cwd = current_dir().unwrap().canonicalize().unwrap();
        let mut root = cwd.clone();
        while let Some(parent) = root.parent() {
            root = parent.into();
        }

        assert_eq!(
            normalize_path(Path::new("file.txt")).unwrap(),
            cwd.join("file.txt")
        );
        assert_eq!(
            normalize_path(Path::new("./file.txt")).unwrap(),
            cwd.join("file.txt")
        );
        assert_eq!(
            normalize_path(Path::new("../file.txt")).unwrap(),
            cwd.parent().unwrap().join("file.txt")
        );
        assert_eq!(
            normalize_path(&cwd.join("file.txt")).unwrap(),
            cwd.join("file.txt")
        );
        assert_eq!(
            normalize_path(&root.join("file.txt")).unwrap(),
            root.join("file.txt")
        );
        assert!(normalize_path(Path::new("missing-dir/file.txt")).is_err());
    }
}
