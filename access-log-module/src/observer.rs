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

//! Observing responses without changing them

use async_trait::async_trait;
use http::{HeaderMap, StatusCode};
use std::io;

/// Writing side of an HTTP response as seen by request handlers
#[async_trait]
pub trait ResponseWriter: Send {
    /// Response headers, these can be modified until the first body write.
    fn headers_mut(&mut self) -> &mut HeaderMap;

    /// Sets the response status. Only the first call is supposed to have an effect.
    fn set_status(&mut self, status: StatusCode);

    /// Writes part of the response body, returning the number of bytes actually written. This
    /// can be less than the size of `data`.
    async fn write_body(&mut self, data: &[u8]) -> io::Result<usize>;

    /// Flushes any data buffered by the writer.
    async fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[async_trait]
impl<W: ResponseWriter + ?Sized> ResponseWriter for &mut W {
    fn headers_mut(&mut self) -> &mut HeaderMap {
        (**self).headers_mut()
    }

    fn set_status(&mut self, status: StatusCode) {
        (**self).set_status(status)
    }

    async fn write_body(&mut self, data: &[u8]) -> io::Result<usize> {
        (**self).write_body(data).await
    }

    async fn flush(&mut self) -> io::Result<()> {
        (**self).flush().await
    }
}

/// Status code and size of a response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseObservation {
    /// First status code set by the handler, `200 OK` if none was set
    pub status: StatusCode,
    /// Number of body bytes accepted by the underlying writer
    pub bytes_sent: u64,
}

impl Default for ResponseObservation {
    fn default() -> Self {
        Self {
            status: StatusCode::OK,
            bytes_sent: 0,
        }
    }
}

/// Response writer wrapper recording the response status and the number of bytes written
///
/// All calls are passed on to the wrapped writer unchanged, including errors.
#[derive(Debug)]
pub struct ResponseObserver<W> {
    inner: W,
    observation: ResponseObservation,
    status_set: bool,
}

impl<W> ResponseObserver<W> {
    /// Wraps a response writer.
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            observation: ResponseObservation::default(),
            status_set: false,
        }
    }

    /// Returns what has been observed so far.
    pub fn observation(&self) -> ResponseObservation {
        self.observation
    }

    /// Returns a reference to the wrapped writer.
    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    /// Unwraps the writer, returning it along with the observation.
    pub fn into_parts(self) -> (W, ResponseObservation) {
        (self.inner, self.observation)
    }
}

#[async_trait]
impl<W: ResponseWriter> ResponseWriter for ResponseObserver<W> {
    fn headers_mut(&mut self) -> &mut HeaderMap {
        self.inner.headers_mut()
    }

    fn set_status(&mut self, status: StatusCode) {
        if !self.status_set {
            self.status_set = true;
            self.observation.status = status;
        }
        self.inner.set_status(status);
    }

    async fn write_body(&mut self, data: &[u8]) -> io::Result<usize> {
        let written = self.inner.write_body(data).await?;
        self.observation.bytes_sent += written as u64;
        Ok(written)
    }

    async fn flush(&mut self) -> io::Result<()> {
        self.inner.flush().await
    }
}
