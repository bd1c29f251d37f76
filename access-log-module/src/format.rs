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

//! Rendering access log lines

use chrono::{DateTime, FixedOffset, Local};
use http::{header, HeaderMap, HeaderValue, Method, Request, Version};
use std::fmt::Write;
use std::net::{IpAddr, SocketAddr};

use crate::configuration::LogFormatKind;
use crate::observer::ResponseObservation;

/// Request extension carrying the address of the client
///
/// Servers should insert it into each request’s extensions, otherwise the client address is
/// logged as `-`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientAddr(pub SocketAddr);

/// Request data captured when the request is received
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestObservation {
    /// IP address of the client if known
    pub remote_addr: Option<IpAddr>,
    /// Request method
    pub method: Method,
    /// Request target as received: usually path and query string, the authority for `CONNECT`
    /// requests or the full URI for requests to proxies
    pub target: String,
    /// HTTP version of the request
    pub version: Version,
    /// Value of the `Referer` request header
    pub referer: Option<HeaderValue>,
    /// Value of the `User-Agent` request header
    pub user_agent: Option<HeaderValue>,
    /// Time the request was received
    pub start: DateTime<FixedOffset>,
}

fn non_empty_header(headers: &HeaderMap, name: header::HeaderName) -> Option<HeaderValue> {
    headers
        .get(name)
        .filter(|value| !value.is_empty())
        .cloned()
}

impl RequestObservation {
    /// Captures the relevant data of a request received at the given time.
    pub fn new<B>(request: &Request<B>, start: DateTime<FixedOffset>) -> Self {
        let remote_addr = request
            .extensions()
            .get::<ClientAddr>()
            .map(|ClientAddr(addr)| addr.ip());

        Self {
            remote_addr,
            method: request.method().clone(),
            target: request.uri().to_string(),
            version: request.version(),
            referer: non_empty_header(request.headers(), header::REFERER),
            user_agent: non_empty_header(request.headers(), header::USER_AGENT),
            start,
        }
    }

    /// Captures the relevant data of a request received just now, using the server’s local
    /// time zone.
    pub fn now<B>(request: &Request<B>) -> Self {
        Self::new(request, Local::now().fixed_offset())
    }
}

fn write_escaped(buf: &mut String, data: impl AsRef<[u8]>) {
    fn is_allowed(byte: u8) -> bool {
        (b' '..=b'~').contains(&byte) && byte != b'"' && byte != b'\\'
    }

    buf.push('"');
    for &byte in data.as_ref() {
        if is_allowed(byte) {
            buf.push(char::from(byte));
        } else {
            let _ = write!(buf, "\\x{byte:02x}");
        }
    }
    buf.push('"');
}

fn write_header(buf: &mut String, value: Option<&HeaderValue>) {
    match value.filter(|value| !value.is_empty()) {
        Some(value) => write_escaped(buf, value),
        None => buf.push_str("\"-\""),
    }
}

fn write_common(buf: &mut String, request: &RequestObservation, response: &ResponseObservation) {
    match request.remote_addr {
        Some(addr) => {
            let _ = write!(buf, "{addr}");
        }
        None => buf.push('-'),
    }

    let time = request.start.format("%d/%b/%Y:%H:%M:%S %z");
    let _ = write!(buf, " - - [{time}] ");

    let method = &request.method;
    let target = &request.target;
    let version = request.version;
    write_escaped(buf, format!("{method} {target} {version:?}"));

    let _ = write!(
        buf,
        " {} {}",
        response.status.as_u16(),
        response.bytes_sent
    );
}

impl LogFormatKind {
    /// Renders the log line for a request, without a line terminator.
    pub fn render(self, request: &RequestObservation, response: &ResponseObservation) -> String {
        let mut buf = String::with_capacity(256);
        match self {
            Self::Common => write_common(&mut buf, request, response),
            Self::Combined => {
                write_common(&mut buf, request, response);
                buf.push(' ');
                write_header(&mut buf, request.referer.as_ref());
                buf.push(' ');
                write_header(&mut buf, request.user_agent.as_ref());
            }
        }
        buf
    }
}

/// Renders the log line for a request in the given format, without a line terminator.
pub fn format_line(
    request: &RequestObservation,
    response: &ResponseObservation,
    kind: LogFormatKind,
) -> String {
    kind.render(request, response)
}
