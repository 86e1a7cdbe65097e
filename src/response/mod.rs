//! Response generation.
//!
//! A parsed `Request` is turned into a `Response` by exactly one `Handler`, picked once per
//! request. Handlers report problems as a `Failure`, which is folded back into the request's
//! status and rendered through the configured error pages.

mod autoindex;
mod cgi;
mod multipart;
mod plain;
mod range;
mod redirect;

use std::fmt::{self, Display, Write as _};
use std::fs;
use std::io;
use std::time::SystemTime;

use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{ErrorMode, LocationConfig, Settings};
use crate::http::{GeneratedOn, HtmlEscaped, HttpDate, Method, MimeMap, Status};
use crate::request::Request;
use crate::server::VirtualHost;

const BLOCKED_UPLOAD_EXTENSIONS: &[&str] = &[".exe", ".bat", ".sh", ".php", ".pl", ".py"];
const HTML_CONTENT_TYPE: &str = "text/html; charset=UTF-8";

/// Why a handler could not produce its response.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{status}: {detail}")]
pub struct Failure {
    pub status: Status,
    pub detail: String,
}

impl Failure {
    pub fn new(status: Status, detail: impl Display) -> Self {
        Self {
            status,
            detail: detail.to_string(),
        }
    }

    /// Map a filesystem error on `what` to the closest status.
    pub fn from_io(error: &io::Error, what: impl Display) -> Self {
        let status = match error.kind() {
            io::ErrorKind::NotFound => Status::NOT_FOUND,
            io::ErrorKind::PermissionDenied => Status::FORBIDDEN,
            io::ErrorKind::AlreadyExists => Status::CONFLICT,
            _ => Status::INTERNAL_SERVER_ERROR,
        };
        Failure::new(status, format!("{}: {}", what, error))
    }
}

#[derive(Debug, Clone)]
pub struct Response {
    pub status: Status,
    fields: Vec<(String, String)>,
    body: Vec<u8>,
    omit_body: bool,
    /// Close the connection after this response whatever the request asked for.
    pub close: bool,
}

impl Response {
    pub fn new(status: Status) -> Self {
        Self {
            status,
            fields: Vec::new(),
            body: Vec::new(),
            omit_body: false,
            close: false,
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Display) -> Self {
        self.fields.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_body(mut self, body: Vec<u8>, content_type: &str) -> Self {
        self.body = body;
        self.with_header("Content-Type", content_type)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(field, _)| field.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Status line, header block and (unless suppressed) body, ready for the socket.
    pub fn serialize(&self, keep_alive: bool, settings: &Settings, now: SystemTime) -> Vec<u8> {
        let mut head = String::new();
        // writing into a String cannot fail
        let _ = write!(head, "HTTP/1.1 {}\r\nDate: {}\r\n", self.status, HttpDate(now));
        if settings.server_id {
            let _ = write!(
                head,
                "Server: {}/{}\r\n",
                env!("CARGO_PKG_NAME"),
                env!("CARGO_PKG_VERSION")
            );
        }
        for (name, value) in &self.fields {
            let _ = write!(head, "{}: {}\r\n", name, value);
        }
        if self.status != Status::NO_CONTENT {
            let _ = write!(head, "Content-Length: {}\r\n", self.body.len());
        }
        if keep_alive && !self.close {
            let _ = write!(
                head,
                "Connection: keep-alive\r\nKeep-Alive: timeout={}\r\n",
                settings.client_timeout_secs
            );
        } else {
            head.push_str("Connection: close\r\n");
        }
        head.push_str("\r\n");

        let mut bytes = head.into_bytes();
        if !self.omit_body {
            bytes.extend_from_slice(&self.body);
        }
        bytes
    }
}

/// Everything a handler may look at while producing a response.
pub(crate) struct Exchange<'a> {
    pub request: &'a Request,
    pub host: &'a mut VirtualHost,
    pub settings: &'a Settings,
    pub mime_map: &'a MimeMap,
}

impl Exchange<'_> {
    fn location(&self) -> Result<&LocationConfig, Failure> {
        self.request
            .location
            .as_deref()
            .and_then(|key| self.host.config.locations.get(key))
            .ok_or_else(|| Failure::new(Status::INTERNAL_SERVER_ERROR, "no resolved location"))
    }

    fn method(&self) -> Result<Method, Failure> {
        self.request
            .method
            .ok_or_else(|| Failure::new(Status::BAD_REQUEST, "missing method"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handler {
    Redirect,
    AutoIndex,
    Cgi,
    Range,
    Multipart,
    Plain,
}

impl Handler {
    pub fn select(request: &Request) -> Self {
        if request.factory == 0 {
            Handler::Plain
        } else if request.redirect {
            Handler::Redirect
        } else if request.autoindex {
            Handler::AutoIndex
        } else if request.cgi {
            Handler::Cgi
        } else if !request.range.is_empty() {
            Handler::Range
        } else if !request.boundary.is_empty() {
            Handler::Multipart
        } else {
            Handler::Plain
        }
    }

    fn handle(self, exchange: &mut Exchange) -> Result<Response, Failure> {
        match self {
            Handler::Redirect => redirect::handle(exchange),
            Handler::AutoIndex => autoindex::handle(exchange),
            Handler::Cgi => cgi::handle(exchange),
            Handler::Range => range::handle(exchange),
            Handler::Multipart => multipart::handle(exchange),
            Handler::Plain => plain::handle(exchange),
        }
    }
}

impl fmt::Display for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Handler::Redirect => "redirect",
            Handler::AutoIndex => "autoindex",
            Handler::Cgi => "cgi",
            Handler::Range => "range",
            Handler::Multipart => "multipart",
            Handler::Plain => "plain",
        };
        f.write_str(name)
    }
}

/// Produce the response for a ready request. Failed requests get an error page.
pub fn dispatch(
    request: &mut Request,
    hosts: &mut [VirtualHost],
    settings: &Settings,
    mime_map: &MimeMap,
) -> Response {
    let index = request.vhost.unwrap_or(0);
    let host = match hosts.get_mut(index) {
        Some(host) => host,
        None => {
            warn!(target: "response", "listener has no virtual host {}", index);
            return generated_error(request.status, &request.detail, settings);
        }
    };

    let mut response = if request.sanity {
        let handler = Handler::select(request);
        debug!(target: "response", "{} handler for {}", handler, request.path);
        let result = handler.handle(&mut Exchange {
            request: &*request,
            host: &mut *host,
            settings,
            mime_map,
        });
        match result {
            Ok(response) => response,
            Err(failure) => {
                request.fail(failure.status, failure.detail);
                error_response(request, host, settings)
            }
        }
    } else {
        error_response(request, host, settings)
    };
    if request.method == Some(Method::Head) {
        response.omit_body = true;
    }
    response
}

/// Render the error page for a failed request.
pub fn error_response(request: &Request, host: &VirtualHost, settings: &Settings) -> Response {
    let status = request.status;
    let location = request
        .location
        .as_deref()
        .and_then(|key| host.config.locations.get(key));
    let (mode, pages) = match location {
        Some(location) => (location.error_mode(), &location.error_pages),
        None => (host.config.error_mode, &host.config.error_pages),
    };
    let page = match (pages.get(&status.code()), mode) {
        (Some(page), _) => Some(page),
        (None, ErrorMode::Template) => host.config.template_error_page.as_ref(),
        (None, ErrorMode::Literal) => None,
    };
    let custom = page.and_then(|page| {
        let path = host.config.resolve_page(page);
        match fs::read_to_string(&path) {
            Ok(text) => Some(text),
            Err(e) => {
                warn!(target: "response", "cannot read error page {}: {}", path, e);
                None
            }
        }
    });

    let mut response = match custom {
        Some(text) => {
            let body = match mode {
                ErrorMode::Template => text
                    .replace("{error_code}", &status.code().to_string())
                    .replace("{error_detail}", &HtmlEscaped(&request.detail).to_string()),
                ErrorMode::Literal => text,
            };
            Response::new(status).with_body(body.into_bytes(), HTML_CONTENT_TYPE)
        }
        None => generated_error(status, &request.detail, settings),
    };
    if status == Status::METHOD_NOT_ALLOWED {
        if let Some(location) = location {
            response = response.with_header("Allow", location.methods.allow_header());
        }
    }
    response
}

/// A generated page for any (erroneous) occasion.
fn generated_error(status: Status, detail: &str, settings: &Settings) -> Response {
    let name = status.reason().unwrap_or("Unknown");
    let page = format!(
        "<html><head><title>{} {}</title></head><body>\n\
        <h1>{}</h1>\n\
        {}\n\
        <hr>\n\
        {}\
        </body></html>\n",
        status.code(),
        name,
        name,
        HtmlEscaped(detail),
        GeneratedOn(settings.server_id, SystemTime::now()),
    );
    Response::new(status).with_body(page.into_bytes(), HTML_CONTENT_TYPE)
}

/// True if uploading a file with this name could plant something executable.
pub fn is_blocked_upload(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    BLOCKED_UPLOAD_EXTENSIONS
        .iter()
        .any(|extension| name.ends_with(extension))
}
