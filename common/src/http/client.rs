use std::{borrow::Cow, io};

use log::debug;

use super::{
    chunked::ChunkedDecoder,
    error::{describe_result, HttpClientError},
    request::HttpRequest,
};
use crate::net::{Connection, Connector};

/// Bytes read from the connection per attempt.
pub const READ_SEGMENT: usize = 1460;

const MAX_HEADER_LINE: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Connecting,
    HeadersSent,
    ReadingHeaders,
    ReadingBody,
    ReadingChunkedBody,
    Done,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: Option<u16>,
    pub content_length: Option<usize>,
    pub keep_alive: bool,
    pub chunked: bool,
    pub body: Vec<u8>,
    wanted: Vec<String>,
    headers: Vec<(String, String)>,
}

impl HttpResponse {
    /// Value of a header that the request asked to collect.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }

    pub fn body_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    fn record_header(&mut self, name: &str, value: &str) {
        if name.eq_ignore_ascii_case("Content-Length") {
            self.content_length = value.parse().ok();
        } else if name.eq_ignore_ascii_case("Connection") {
            self.keep_alive = value.eq_ignore_ascii_case("keep-alive");
        }
        if let Some(wanted) = self.wanted.iter().find(|key| key.eq_ignore_ascii_case(name)) {
            self.headers.push((wanted.clone(), value.to_string()));
        }
    }
}

enum Step {
    Continue,
    Wait,
    Finished(Result<u16, HttpClientError>),
}

/// One outbound request driven to completion by repeated, non-blocking polls.
pub struct HttpClient {
    request: Option<HttpRequest>,
    phase: Phase,
    connection: Option<Box<dyn Connection>>,
    outgoing: Vec<u8>,
    head_len: usize,
    written: usize,
    timeout_ms: u64,
    expects_body: bool,
    body_limit: usize,
    started_at: u64,
    last_data_at: u64,
    line: Vec<u8>,
    transfer_encoding: Option<String>,
    remaining: Option<usize>,
    chunked: Option<ChunkedDecoder>,
    response: HttpResponse,
    outcome: Option<Result<u16, HttpClientError>>,
    drained: bool,
    kept_for: Option<(String, u16)>,
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClient {
    pub fn new() -> Self {
        Self {
            request: None,
            phase: Phase::Idle,
            connection: None,
            outgoing: Vec::new(),
            head_len: 0,
            written: 0,
            timeout_ms: 0,
            expects_body: true,
            body_limit: 0,
            started_at: 0,
            last_data_at: 0,
            line: Vec::new(),
            transfer_encoding: None,
            remaining: None,
            chunked: None,
            response: HttpResponse::default(),
            outcome: None,
            drained: false,
            kept_for: None,
        }
    }

    /// Arms the client. Nothing touches the network until the next poll.
    ///
    /// A connection kept alive by the previous request is reused when this request also asks
    /// for reuse and goes to the same host and port.
    pub fn begin(&mut self, request: HttpRequest) {
        let same_peer = self
            .kept_for
            .as_ref()
            .is_some_and(|(host, port)| *host == request.target.host && *port == request.target.port);
        if !(request.reuse && same_peer) {
            self.close();
        }
        self.kept_for = None;
        self.drained = false;
        let head = request.encode_head();
        self.head_len = head.len();
        self.outgoing = head.into_bytes();
        self.outgoing.extend_from_slice(request.body.as_bytes());
        self.written = 0;
        self.timeout_ms = request.timeout_ms;
        self.expects_body = request.expects_body();
        self.body_limit = request.body_limit;
        self.line.clear();
        self.transfer_encoding = None;
        self.remaining = None;
        self.chunked = None;
        self.response = HttpResponse {
            wanted: request.collected_headers().to_vec(),
            ..HttpResponse::default()
        };
        self.outcome = None;
        self.phase = Phase::Idle;
        self.request = Some(request);
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn request(&self) -> Option<&HttpRequest> {
        self.request.as_ref()
    }

    pub fn response(&self) -> &HttpResponse {
        &self.response
    }

    pub fn outcome(&self) -> Option<Result<u16, HttpClientError>> {
        self.outcome
    }

    pub fn close(&mut self) {
        self.kept_for = None;
        if let Some(mut connection) = self.connection.take() {
            connection.close();
        }
    }

    /// Advances the request as far as it can go without waiting.
    /// Returns the outcome once the request reaches a terminal phase.
    pub fn poll(
        &mut self,
        now_ms: u64,
        connector: &mut dyn Connector,
    ) -> Option<Result<u16, HttpClientError>> {
        if self.phase == Phase::Done {
            return self.outcome;
        }
        if self.request.is_none() {
            return None;
        }
        loop {
            match self.step(now_ms, connector) {
                Step::Continue => {}
                Step::Wait => return None,
                Step::Finished(result) => {
                    self.finish(result);
                    return Some(result);
                }
            }
        }
    }

    fn step(&mut self, now_ms: u64, connector: &mut dyn Connector) -> Step {
        match self.phase {
            Phase::Idle => self.start_connect(now_ms, connector),
            Phase::Connecting => self.poll_connect(now_ms),
            Phase::HeadersSent => self.flush(now_ms),
            Phase::ReadingHeaders | Phase::ReadingBody | Phase::ReadingChunkedBody => {
                self.read(now_ms)
            }
            Phase::Done => Step::Wait,
        }
    }

    fn start_connect(&mut self, now_ms: u64, connector: &mut dyn Connector) -> Step {
        let Some(request) = self.request.as_ref() else {
            return Step::Finished(Err(HttpClientError::NoBegin));
        };
        let target = &request.target;
        if self.connection.is_some() {
            debug!("Reusing connection to {}:{}", target.host, target.port);
            self.last_data_at = now_ms;
            self.phase = Phase::HeadersSent;
            return Step::Continue;
        }
        debug!("Connecting to {}:{}", target.host, target.port);
        match connector.connect(&target.host, target.port, self.timeout_ms) {
            Ok(connection) => {
                self.connection = Some(connection);
                self.started_at = now_ms;
                self.phase = Phase::Connecting;
                Step::Continue
            }
            Err(err) => Step::Finished(Err(connect_error(&err))),
        }
    }

    fn poll_connect(&mut self, now_ms: u64) -> Step {
        let Some(connection) = self.connection.as_mut() else {
            return Step::Finished(Err(HttpClientError::NotConnected));
        };
        match connection.poll_connect() {
            Ok(true) => {
                self.last_data_at = now_ms;
                self.phase = Phase::HeadersSent;
                Step::Continue
            }
            Ok(false) if now_ms.saturating_sub(self.started_at) > self.timeout_ms => {
                Step::Finished(Err(HttpClientError::ConnectTimeout))
            }
            Ok(false) => Step::Wait,
            Err(err) => Step::Finished(Err(connect_error(&err))),
        }
    }

    /// Writes the request, resuming after partial writes on later ticks.
    fn flush(&mut self, now_ms: u64) -> Step {
        let Some(connection) = self.connection.as_mut() else {
            return Step::Finished(Err(HttpClientError::NotConnected));
        };
        while self.written < self.outgoing.len() {
            let send_error = if self.written < self.head_len {
                HttpClientError::SendHeaderFailed
            } else {
                HttpClientError::SendPayloadFailed
            };
            match connection.write(&self.outgoing[self.written..]) {
                Ok(0) => return Step::Finished(Err(send_error)),
                Ok(sent) => {
                    self.written += sent;
                    self.last_data_at = now_ms;
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return if now_ms.saturating_sub(self.last_data_at) > self.timeout_ms {
                        Step::Finished(Err(send_error))
                    } else {
                        Step::Wait
                    };
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(_) => return Step::Finished(Err(send_error)),
            }
        }
        self.outgoing = Vec::new();
        self.phase = Phase::ReadingHeaders;
        Step::Continue
    }

    fn read(&mut self, now_ms: u64) -> Step {
        let Some(connection) = self.connection.as_mut() else {
            return Step::Finished(Err(HttpClientError::NotConnected));
        };
        let mut buf = [0u8; READ_SEGMENT];
        match connection.read(&mut buf) {
            Ok(0) => Step::Finished(self.end_of_stream()),
            Ok(len) => {
                self.last_data_at = now_ms;
                match self.consume(&buf[..len]) {
                    Some(result) => {
                        self.drained = true;
                        Step::Finished(result)
                    }
                    None => Step::Continue,
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                if now_ms.saturating_sub(self.last_data_at) > self.timeout_ms {
                    Step::Finished(Err(HttpClientError::ReadTimeout))
                } else {
                    Step::Wait
                }
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => Step::Continue,
            Err(_) => Step::Finished(Err(HttpClientError::ConnectionLost)),
        }
    }

    fn consume(&mut self, data: &[u8]) -> Option<Result<u16, HttpClientError>> {
        let mut pos = 0;
        while pos < data.len() {
            match self.phase {
                Phase::ReadingHeaders => {
                    let line = match self.next_line(data, &mut pos) {
                        Ok(Some(line)) => line,
                        Ok(None) => break,
                        Err(err) => return Some(Err(err)),
                    };
                    if let Some(result) = self.header_line(&line) {
                        return Some(result);
                    }
                }
                Phase::ReadingBody => {
                    let available = data.len() - pos;
                    let take = self.remaining.map_or(available, |left| left.min(available));
                    if self.response.body.len() + take > self.body_limit {
                        return Some(Err(HttpClientError::TooLittleRam));
                    }
                    self.response
                        .body
                        .extend_from_slice(&data[pos..pos + take]);
                    pos += take;
                    if let Some(left) = self.remaining.as_mut() {
                        *left -= take;
                        if *left == 0 {
                            return Some(Ok(self.status()));
                        }
                    }
                }
                Phase::ReadingChunkedBody => {
                    let decoder = self.chunked.get_or_insert_with(ChunkedDecoder::new);
                    match decoder.feed(&data[pos..], &mut self.response.body) {
                        Ok(consumed) => pos += consumed,
                        Err(err) => return Some(Err(err)),
                    }
                    if self.response.body.len() > self.body_limit {
                        return Some(Err(HttpClientError::TooLittleRam));
                    }
                    if decoder.is_done() {
                        let status = self.response.status.unwrap_or_default();
                        return Some(decoder.finish(self.response.content_length).map(|_| status));
                    }
                }
                _ => break,
            }
        }
        None
    }

    fn next_line(&mut self, data: &[u8], pos: &mut usize) -> Result<Option<String>, HttpClientError> {
        while *pos < data.len() {
            let byte = data[*pos];
            *pos += 1;
            if byte == b'\n' {
                let line = std::mem::take(&mut self.line);
                return Ok(Some(String::from_utf8_lossy(&line).trim().to_string()));
            }
            if self.line.len() >= MAX_HEADER_LINE {
                return Err(HttpClientError::TooLittleRam);
            }
            self.line.push(byte);
        }
        Ok(None)
    }

    fn header_line(&mut self, line: &str) -> Option<Result<u16, HttpClientError>> {
        if line.is_empty() {
            return self.end_of_headers();
        }
        if line.starts_with("HTTP/1.") {
            self.response.status = line
                .split_whitespace()
                .nth(1)
                .and_then(|code| code.parse().ok());
            return None;
        }
        if let Some((name, value)) = line.split_once(':') {
            let (name, value) = (name.trim(), value.trim());
            if name.eq_ignore_ascii_case("Transfer-Encoding") {
                self.transfer_encoding = Some(value.to_string());
            }
            self.response.record_header(name, value);
        }
        None
    }

    fn end_of_headers(&mut self) -> Option<Result<u16, HttpClientError>> {
        let Some(status) = self.response.status else {
            return Some(Err(HttpClientError::NoHttpServer));
        };
        if let Some(encoding) = self.transfer_encoding.take() {
            if !encoding.eq_ignore_ascii_case("chunked") {
                return Some(Err(HttpClientError::Encoding));
            }
            self.response.chunked = true;
        }

        let bodiless = !self.expects_body
            || status < 200
            || status == 204
            || status == 304
            || (!self.response.chunked && self.response.content_length == Some(0));
        if bodiless {
            return Some(Ok(status));
        }

        if self.response.chunked {
            self.chunked = Some(ChunkedDecoder::new());
            self.phase = Phase::ReadingChunkedBody;
        } else {
            if let Some(len) = self.response.content_length {
                if len > self.body_limit || self.response.body.try_reserve(len).is_err() {
                    return Some(Err(HttpClientError::TooLittleRam));
                }
            }
            self.remaining = self.response.content_length;
            self.phase = Phase::ReadingBody;
        }
        None
    }

    fn end_of_stream(&self) -> Result<u16, HttpClientError> {
        match self.phase {
            Phase::ReadingHeaders => self.response.status.ok_or(HttpClientError::ConnectionLost),
            Phase::ReadingBody if self.remaining.is_none() => Ok(self.status()),
            _ => Err(HttpClientError::ConnectionLost),
        }
    }

    fn status(&self) -> u16 {
        self.response.status.unwrap_or_default()
    }

    fn finish(&mut self, result: Result<u16, HttpClientError>) {
        if let Some(request) = self.request.as_ref() {
            debug!(
                "{} {}{} finished: {}",
                request.method.as_str(),
                request.target.host_header(),
                request.target.path,
                describe_result(result)
            );
        }
        let keep = result.is_ok()
            && self.drained
            && self.response.keep_alive
            && self.request.as_ref().is_some_and(|request| request.reuse);
        let kept_for = self
            .request
            .as_ref()
            .filter(|_| keep)
            .map(|request| (request.target.host.clone(), request.target.port));
        if kept_for.is_none() {
            self.close();
        }
        self.kept_for = kept_for;
        self.phase = Phase::Done;
        self.outcome = Some(result);
    }
}

fn connect_error(err: &io::Error) -> HttpClientError {
    match err.kind() {
        io::ErrorKind::TimedOut => HttpClientError::ConnectTimeout,
        io::ErrorKind::ConnectionRefused => HttpClientError::ConnectionRefused,
        _ => HttpClientError::NotConnected,
    }
}
