//! Resumable HTTP request parsing.
//!
//! A `Request` accumulates state across readiness events. Each call to `advance` moves it as far
//! as the buffered bytes allow and returns; nothing is re-parsed from scratch.

pub mod chunked;
mod resolve;

pub use chunked::{ChunkError, ChunkedDecoder};
pub use resolve::Resolution;

use std::fmt::Display;
use std::time::Instant;

use tracing::{debug, warn};

use crate::config::Settings;
use crate::http::{field_value, find, make_safe_url, url_decode, Method, Status};
use crate::server::VirtualHost;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    AwaitingHeader,
    AwaitingBody,
    /// Parsed, or failed with `sanity` cleared. Either way the dispatcher takes over.
    Ready,
}

#[derive(Debug)]
pub struct Request {
    pub state: ParseState,
    pub header: String,
    pub method: Option<Method>,
    pub target: String,
    pub http10: bool,
    pub path: String,
    pub query: String,
    pub normalized_path: String,
    pub script: String,
    pub path_info: String,
    pub content_length: usize,
    pub content_type: String,
    pub boundary: String,
    pub chunked: bool,
    pub range: String,
    pub cookie: String,
    pub referer: String,
    pub host: String,
    pub keep_alive: bool,
    /// Index of the resolved virtual host within the listener.
    pub vhost: Option<usize>,
    /// Key of the resolved location within the virtual host.
    pub location: Option<String>,
    pub cgi: bool,
    pub autoindex: bool,
    pub redirect: bool,
    pub from_cache: bool,
    pub sanity: bool,
    pub status: Status,
    pub detail: String,
    /// Number of reasons this request needs something other than the plain handler.
    pub factory: u32,
    pub body: Vec<u8>,
    body_loaded: bool,
    started: Option<Instant>,
    decoder: ChunkedDecoder,
}

impl Default for Request {
    fn default() -> Self {
        Self::new()
    }
}

impl Request {
    pub fn new() -> Self {
        Self {
            state: ParseState::AwaitingHeader,
            header: String::new(),
            method: None,
            target: String::new(),
            http10: false,
            path: String::new(),
            query: String::new(),
            normalized_path: String::new(),
            script: String::new(),
            path_info: String::new(),
            content_length: 0,
            content_type: String::new(),
            boundary: String::new(),
            chunked: false,
            range: String::new(),
            cookie: String::new(),
            referer: String::new(),
            host: String::new(),
            keep_alive: false,
            vhost: None,
            location: None,
            cgi: false,
            autoindex: false,
            redirect: false,
            from_cache: false,
            sanity: true,
            status: Status::OK,
            detail: String::new(),
            factory: 0,
            body: Vec::new(),
            body_loaded: false,
            started: None,
            decoder: ChunkedDecoder::default(),
        }
    }

    /// True once any byte of this request has arrived.
    pub fn has_started(&self) -> bool {
        self.started.is_some()
    }

    /// Mark the request unsane. No further parsing step runs afterwards.
    pub fn fail(&mut self, status: Status, detail: impl Display) {
        let detail = detail.to_string();
        if status.code() >= 500 {
            warn!(target: "request", "{} {}: {}", status.code(), self.target, detail);
        } else {
            debug!(target: "request", "{} {}: {}", status.code(), self.target, detail);
        }
        // an unread body would be parsed as the next request
        if !self.body_loaded && (self.chunked || self.content_length > 0) {
            self.keep_alive = false;
        }
        self.sanity = false;
        self.status = status;
        self.detail = detail;
        self.state = ParseState::Ready;
    }

    /// Feed buffered bytes through the parsing pipeline. Consumed bytes are drained from
    /// `buffer`; anything belonging to the next request stays there.
    pub fn advance(
        &mut self,
        buffer: &mut Vec<u8>,
        hosts: &mut [VirtualHost],
        settings: &Settings,
        now: Instant,
    ) -> ParseState {
        if self.started.is_none() {
            // tolerate stray CRLFs between keep-alive requests
            while buffer.starts_with(b"\r\n") {
                buffer.drain(..2);
            }
            if !buffer.is_empty() {
                self.started = Some(now);
            }
        }
        if self.state == ParseState::AwaitingHeader {
            self.receive_header(buffer, hosts, settings);
        }
        if self.state == ParseState::AwaitingBody {
            self.receive_body(buffer, hosts);
        }
        if let Some(started) = self.started {
            if self.state != ParseState::Ready
                && now.saturating_duration_since(started) >= settings.request_timeout()
            {
                self.keep_alive = false;
                self.fail(Status::REQUEST_TIMEOUT, "request was not completed in time");
            }
        }
        self.state
    }

    fn receive_header(
        &mut self,
        buffer: &mut Vec<u8>,
        hosts: &mut [VirtualHost],
        settings: &Settings,
    ) {
        let end = match find(b"\r\n\r\n", buffer) {
            Some(end) if end <= settings.max_header_size => end,
            None if buffer.len() <= settings.max_header_size => return,
            _ => {
                self.keep_alive = false;
                self.fail(
                    Status::HEADER_FIELDS_TOO_LARGE,
                    format!("request header exceeds {} bytes", settings.max_header_size),
                );
                return;
            }
        };
        let head: Vec<u8> = buffer.drain(..end + 4).collect();
        self.header = String::from_utf8_lossy(&head[..end]).into_owned();

        let parsed = self.check_header()
            && self.parse_request_line(settings)
            && self.split_query()
            && self.load_fields(settings)
            && self.resolve_host(hosts)
            && self.resolve_resource(hosts);
        if parsed {
            self.state = ParseState::AwaitingBody;
        }
    }

    fn check_header(&mut self) -> bool {
        if self.header.trim().is_empty() {
            self.fail(Status::BAD_REQUEST, "empty request header");
        }
        self.sanity
    }

    fn parse_request_line(&mut self, settings: &Settings) -> bool {
        let (method, target, version) = {
            let line = self.header.lines().next().unwrap_or_default();
            let mut parts = line.split(' ');
            (
                parts.next().unwrap_or_default().to_string(),
                parts.next().unwrap_or_default().to_string(),
                parts.next().unwrap_or_default().to_string(),
            )
        };
        self.target = target;
        self.method = match method.parse::<Method>() {
            Ok(method) => Some(method),
            Err(()) => {
                self.fail(Status::BAD_REQUEST, format!("unknown method `{}`", method));
                return false;
            }
        };
        if self.target.is_empty() {
            self.fail(Status::BAD_REQUEST, "missing request target");
        } else if self.target.len() > settings.max_uri_length {
            self.fail(
                Status::URI_TOO_LONG,
                format!("request target exceeds {} bytes", settings.max_uri_length),
            );
        } else {
            match version.as_str() {
                "HTTP/1.1" => {}
                "HTTP/1.0" => self.http10 = true,
                _ => self.fail(
                    Status::BAD_REQUEST,
                    format!("unsupported protocol `{}`", version),
                ),
            }
        }
        self.sanity
    }

    fn split_query(&mut self) -> bool {
        let (path, query) = match self.target.split_once('?') {
            Some((path, query)) => (path.to_string(), query.to_string()),
            None => (self.target.clone(), String::new()),
        };
        // absolute-form targets carry a scheme and authority
        let path = match path
            .strip_prefix("http://")
            .or_else(|| path.strip_prefix("https://"))
        {
            Some(rest) => rest.find('/').map_or("/", |slash| &rest[slash..]).to_string(),
            None => path,
        };
        let decoded = url_decode(&path);
        match make_safe_url(&decoded) {
            Some(safe) if !safe.contains('\0') => {
                self.path = safe;
                self.query = query;
            }
            _ => self.fail(Status::BAD_REQUEST, format!("unsafe path `{}`", path)),
        }
        self.sanity
    }

    fn load_fields(&mut self, settings: &Settings) -> bool {
        let fields = match self.header.split_once("\r\n") {
            Some((_, fields)) => fields.to_string(),
            None => String::new(),
        };

        let persistent = match field_value(&fields, "Connection") {
            Some(value) if has_token(value, "close") => false,
            Some(value) if has_token(value, "keep-alive") => true,
            _ => !self.http10,
        };
        self.keep_alive = settings.keep_alive && persistent;

        if let Some(value) = field_value(&fields, "Transfer-Encoding") {
            self.chunked = has_token(value, "chunked");
        }
        if let Some(value) = field_value(&fields, "Content-Length") {
            if !self.chunked {
                if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
                    self.fail(Status::BAD_REQUEST, format!("invalid Content-Length `{}`", value));
                    return false;
                }
                match value.parse() {
                    Ok(length) => self.content_length = length,
                    Err(_) => {
                        self.fail(Status::PAYLOAD_TOO_LARGE, "Content-Length out of range");
                        return false;
                    }
                }
            }
        }
        if let Some(value) = field_value(&fields, "Content-Type") {
            let (media_type, params) = value.split_once(';').unwrap_or((value, ""));
            if media_type.trim().eq_ignore_ascii_case("multipart/form-data") {
                let boundary = params
                    .split(';')
                    .filter_map(|param| param.trim().split_once('='))
                    .find(|(name, _)| name.trim().eq_ignore_ascii_case("boundary"))
                    .map(|(_, boundary)| boundary.trim().trim_matches('"'))
                    .unwrap_or_default();
                if boundary.is_empty() {
                    self.fail(Status::BAD_REQUEST, "multipart body without boundary");
                    return false;
                }
                self.content_type = media_type.trim().to_string();
                self.boundary = boundary.to_string();
                self.factory += 1;
            } else {
                self.content_type = value.to_string();
            }
        }
        if let Some(value) = field_value(&fields, "Range") {
            if !value.is_empty() {
                self.range = value.to_string();
                self.factory += 1;
            }
        }
        self.cookie = field_value(&fields, "Cookie").unwrap_or_default().to_string();
        self.referer = field_value(&fields, "Referer").unwrap_or_default().to_string();
        self.host = field_value(&fields, "Host").unwrap_or_default().to_string();
        true
    }

    fn resolve_host(&mut self, hosts: &[VirtualHost]) -> bool {
        let name = normalize_host(&self.host);
        let index = if name.is_empty() {
            (!hosts.is_empty()).then(|| 0)
        } else {
            hosts.iter().position(|host| host.config.answers_to(&name))
        };
        match index {
            Some(index) => self.vhost = Some(index),
            None => self.fail(
                Status::INTERNAL_SERVER_ERROR,
                format!("no virtual host configured for `{}`", name),
            ),
        }
        self.sanity
    }

    fn receive_body(&mut self, buffer: &mut Vec<u8>, hosts: &[VirtualHost]) {
        let limit = self
            .vhost
            .and_then(|index| hosts.get(index))
            .map_or(usize::MAX, |host| host.config.client_max_body_size);
        if self.chunked {
            match self.decoder.decode(buffer, limit) {
                Ok(false) => return,
                Ok(true) => {
                    self.body = self.decoder.take_body();
                    self.content_length = self.body.len();
                }
                Err(ChunkError::TooLarge(limit)) => {
                    self.fail(
                        Status::PAYLOAD_TOO_LARGE,
                        format!("chunked body exceeds {} bytes", limit),
                    );
                    return;
                }
                Err(e) => {
                    self.fail(Status::BAD_REQUEST, e);
                    return;
                }
            }
        } else if self.content_length > 0 {
            if self.content_length > limit {
                self.fail(
                    Status::PAYLOAD_TOO_LARGE,
                    format!("body of {} bytes exceeds {}", self.content_length, limit),
                );
                return;
            }
            if buffer.len() < self.content_length {
                return;
            }
            self.body = buffer.drain(..self.content_length).collect();
        }
        self.body_loaded = true;
        if self.validate(hosts) {
            self.state = ParseState::Ready;
        }
    }

    fn validate(&mut self, hosts: &[VirtualHost]) -> bool {
        let location = self.vhost.and_then(|index| hosts.get(index)).and_then(|host| {
            self.location
                .as_deref()
                .and_then(|key| host.config.locations.get(key))
        });
        let (methods, cgi_enabled) = match location {
            Some(location) => (location.methods, location.cgi),
            None => {
                self.fail(Status::INTERNAL_SERVER_ERROR, "request has no resolved location");
                return false;
            }
        };
        let method = match self.method {
            Some(method) => method,
            None => {
                self.fail(Status::BAD_REQUEST, "missing method");
                return false;
            }
        };
        if !methods.allows(method) {
            self.fail(
                Status::METHOD_NOT_ALLOWED,
                format!("{} is not allowed for {}", method, self.path),
            );
        } else if method.forbids_body() && !self.body.is_empty() {
            self.fail(Status::BAD_REQUEST, format!("{} request with a body", method));
        } else if method.requires_body() && self.body.is_empty() {
            self.fail(Status::BAD_REQUEST, format!("{} request without a body", method));
        } else if self.cgi && !cgi_enabled {
            self.fail(Status::FORBIDDEN, "CGI execution is disabled for this location");
        }
        self.sanity
    }
}

fn has_token(value: &str, token: &str) -> bool {
    value
        .split(',')
        .any(|item| item.trim().eq_ignore_ascii_case(token))
}

/// Lowercase host name without port or trailing dot.
fn normalize_host(host: &str) -> String {
    let host = host.trim();
    let name = match host.strip_prefix('[') {
        Some(rest) => rest.split(']').next().unwrap_or(rest),
        None => host.split(':').next().unwrap_or(host),
    };
    name.trim_end_matches('.').to_ascii_lowercase()
}
