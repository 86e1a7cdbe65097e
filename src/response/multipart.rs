//! `multipart/form-data` uploads into a directory.

use std::fs::OpenOptions;
use std::io::{self, Write};

use tracing::{debug, warn};

use super::{is_blocked_upload, Exchange, Failure, Response};
use crate::http::{field_value, find, Method, Status};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Part {
    pub name: String,
    /// Final path component of the client's filename. Empty for plain form fields.
    pub filename: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

impl Part {
    fn from_headers(headers: &str, data: Vec<u8>) -> Self {
        let disposition = field_value(headers, "Content-Disposition").unwrap_or_default();
        let filename = disposition_param(disposition, "filename");
        let filename = filename
            .rsplit(|c| c == '/' || c == '\\')
            .next()
            .unwrap_or_default()
            .to_string();
        Self {
            name: disposition_param(disposition, "name"),
            filename,
            content_type: field_value(headers, "Content-Type")
                .unwrap_or_default()
                .to_string(),
            data,
        }
    }
}

fn disposition_param(disposition: &str, key: &str) -> String {
    disposition
        .split(';')
        .skip(1)
        .filter_map(|param| param.trim().split_once('='))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case(key))
        .map(|(_, value)| value.trim().trim_matches('"').to_string())
        .unwrap_or_default()
}

fn malformed(detail: &str) -> Failure {
    Failure::new(Status::BAD_REQUEST, format!("malformed multipart body: {}", detail))
}

/// Split a multipart body into its parts.
pub fn parse_parts(body: &[u8], boundary: &str) -> Result<Vec<Part>, Failure> {
    let delimiter = format!("--{}", boundary).into_bytes();
    let separator = [&b"\r\n"[..], &delimiter].concat();
    let mut pos = find(&delimiter, body).ok_or_else(|| malformed("boundary not found"))?
        + delimiter.len();
    let mut parts = Vec::new();
    loop {
        let rest = &body[pos..];
        if rest.starts_with(b"--") {
            break;
        }
        let rest = rest
            .strip_prefix(&b"\r\n"[..])
            .ok_or_else(|| malformed("bad delimiter line"))?;
        let headers_end =
            find(b"\r\n\r\n", rest).ok_or_else(|| malformed("part without header block"))?;
        let headers = String::from_utf8_lossy(&rest[..headers_end]);
        let data_start = headers_end + 4;
        let data_len = find(&separator, &rest[data_start..])
            .ok_or_else(|| malformed("unterminated part"))?;
        parts.push(Part::from_headers(
            &headers,
            rest[data_start..data_start + data_len].to_vec(),
        ));
        pos = body.len() - rest.len() + data_start + data_len + separator.len();
    }
    Ok(parts)
}

fn save_file(path: &str, data: &[u8]) -> io::Result<()> {
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)?
        .write_all(data)
}

pub(super) fn handle(exchange: &mut Exchange) -> Result<Response, Failure> {
    let request = exchange.request;
    if exchange.method()? != Method::Post {
        return Err(Failure::new(
            Status::BAD_REQUEST,
            "multipart bodies are only accepted with POST",
        ));
    }
    if request.content_length == 0 {
        return Err(Failure::new(Status::LENGTH_REQUIRED, "multipart body without length"));
    }
    if request.content_type.is_empty() {
        return Err(Failure::new(Status::BAD_REQUEST, "multipart body without content type"));
    }
    if request.body.is_empty() {
        return Err(Failure::new(Status::BAD_REQUEST, "empty multipart body"));
    }
    if request.body.len() != request.content_length {
        return Err(Failure::new(
            Status::BAD_REQUEST,
            format!(
                "received {} bytes but Content-Length is {}",
                request.body.len(),
                request.content_length
            ),
        ));
    }
    let dir = &request.normalized_path;
    if !dir.ends_with('/') {
        return Err(Failure::new(
            Status::BAD_REQUEST,
            format!("{} is not a directory", request.path),
        ));
    }

    let parts = parse_parts(&request.body, &request.boundary)?;
    let files: Vec<&Part> = parts
        .iter()
        .filter(|part| !part.filename.is_empty())
        .collect();
    if files.is_empty() {
        return Err(Failure::new(Status::BAD_REQUEST, "multipart body has no files"));
    }
    if let Some(part) = files.iter().find(|part| is_blocked_upload(&part.filename)) {
        return Err(Failure::new(
            Status::UNSUPPORTED_MEDIA_TYPE,
            format!("uploads like {} are not accepted", part.filename),
        ));
    }

    for (saved, part) in files.iter().enumerate() {
        let target = format!("{}{}", dir, part.filename);
        if let Err(e) = save_file(&target, &part.data) {
            if saved == 0 {
                return Err(Failure::from_io(&e, &part.filename));
            }
            warn!(target: "response", "saved {} of {} uploads, {}: {}", saved, files.len(), target, e);
            return Ok(Response::new(Status::MULTI_STATUS)
                .with_body(b"Partially Created\n".to_vec(), "text/plain"));
        }
        debug!(target: "response", "saved upload {} ({} bytes)", target, part.data.len());
    }
    Ok(Response::new(Status::CREATED).with_body(b"Created\n".to_vec(), "text/plain"))
}
