//! Single byte-range responses.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

use super::{Exchange, Failure, Response};
use crate::http::{Method, Status};

/// Bytes served for an open-ended `start-` range.
pub const DEFAULT_RANGE_BYTES: u64 = 1 << 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ByteRange {
    /// `start-end`
    Bounded(u64, u64),
    /// `start-`
    From(u64),
    /// `-length`, counted from the end of the file
    Suffix(u64),
}

impl ByteRange {
    fn parse(field: &str) -> Option<Self> {
        let spec = field.trim().strip_prefix("bytes=")?.trim();
        if spec.contains(',') {
            return None;
        }
        let (start, end) = spec.split_once('-')?;
        let (start, end) = (start.trim(), end.trim());
        match (start.is_empty(), end.is_empty()) {
            (false, false) => Some(ByteRange::Bounded(offset(start)?, offset(end)?)),
            (false, true) => Some(ByteRange::From(offset(start)?)),
            (true, false) => Some(ByteRange::Suffix(offset(end)?)),
            (true, true) => None,
        }
    }

    /// Inclusive bounds within a file of `size` bytes, or None if unsatisfiable.
    fn resolve(self, size: u64) -> Option<(u64, u64)> {
        let last = size.checked_sub(1)?;
        let (start, end) = match self {
            ByteRange::Bounded(start, end) => (start, end.min(last)),
            ByteRange::From(start) => (
                start,
                start.saturating_add(DEFAULT_RANGE_BYTES - 1).min(last),
            ),
            ByteRange::Suffix(0) => return None,
            ByteRange::Suffix(length) => (size.saturating_sub(length), last),
        };
        (start < size && start <= end).then(|| (start, end))
    }
}

fn offset(digits: &str) -> Option<u64> {
    if digits.bytes().all(|b| b.is_ascii_digit()) {
        digits.parse().ok()
    } else {
        None
    }
}

pub(super) fn handle(exchange: &mut Exchange) -> Result<Response, Failure> {
    let request = exchange.request;
    if !matches!(exchange.method()?, Method::Get | Method::Head) {
        return Err(Failure::new(
            Status::BAD_REQUEST,
            "ranges are only served for GET and HEAD",
        ));
    }
    let range = ByteRange::parse(&request.range).ok_or_else(|| {
        Failure::new(
            Status::RANGE_NOT_SATISFIABLE,
            format!("malformed range `{}`", request.range),
        )
    })?;

    let path = &request.normalized_path;
    let mut file = File::open(path).map_err(|e| Failure::from_io(&e, &request.path))?;
    let size = file
        .metadata()
        .map_err(|e| Failure::from_io(&e, &request.path))?
        .len();
    let (start, end) = range.resolve(size).ok_or_else(|| {
        Failure::new(
            Status::RANGE_NOT_SATISFIABLE,
            format!("range `{}` outside {} bytes", request.range, size),
        )
    })?;

    let mut body = Vec::new();
    file.seek(SeekFrom::Start(start))
        .map_err(|e| Failure::from_io(&e, &request.path))?;
    file.by_ref()
        .take(end - start + 1)
        .read_to_end(&mut body)
        .map_err(|e| Failure::from_io(&e, &request.path))?;

    let content_type = exchange.mime_map.content_type(path);
    if start == 0 && end == size - 1 {
        let mut response = Response::new(Status::OK)
            .with_header("Accept-Ranges", "bytes")
            .with_body(body, content_type);
        response.close = true;
        return Ok(response);
    }
    Ok(Response::new(Status::PARTIAL_CONTENT)
        .with_header("Accept-Ranges", "bytes")
        .with_header("Content-Range", format!("bytes {}-{}/{}", start, end, size))
        .with_body(body, content_type))
}
