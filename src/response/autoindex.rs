//! Generated directory listings.

use std::fmt;
use std::fs::{self, DirEntry};
use std::time::SystemTime;

use chrono::{DateTime, Local};

use super::{Exchange, Failure, Response, HTML_CONTENT_TYPE};
use crate::http::{GeneratedOn, HtmlEscaped, Status, UrlEncoded};

/// Table rows for a sorted directory listing. Links are absolute, rooted at `base`.
struct Listing {
    base: String,
    entries: Vec<DirEntry>,
}

impl fmt::Display for Listing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for entry in &self.entries {
            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(_) => continue,
            };
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let (href_suffix, size) = if metadata.is_dir() {
                ("/", "Directory".to_string())
            } else {
                ("", format!("{} bytes", metadata.len()))
            };
            let modified = metadata
                .modified()
                .map(|time| {
                    DateTime::<Local>::from(time)
                        .format("%Y-%m-%d %H:%M:%S")
                        .to_string()
                })
                .unwrap_or_default();
            writeln!(
                f,
                "<tr><td><a href=\"{}{}{}\">{}</a></td><td>{}</td><td>{}</td></tr>",
                self.base,
                UrlEncoded(&name),
                href_suffix,
                HtmlEscaped(&name),
                size,
                modified
            )?;
        }
        Ok(())
    }
}

/// Percent-encode each segment of a path, keeping the separators.
fn encode_path(path: &str) -> String {
    path.split('/')
        .map(|segment| UrlEncoded(segment).to_string())
        .collect::<Vec<_>>()
        .join("/")
}

pub(super) fn handle(exchange: &mut Exchange) -> Result<Response, Failure> {
    let request = exchange.request;
    let mut entries: Vec<DirEntry> = fs::read_dir(&request.normalized_path)
        .map_err(|e| Failure::from_io(&e, &request.path))?
        .filter_map(|entry| entry.ok())
        .collect();
    entries.sort_by_key(|entry| entry.file_name());

    let title = if request.path.ends_with('/') {
        request.path.clone()
    } else {
        format!("{}/", request.path)
    };
    let page = format!(
        "<html>\n<head>\n<title>Index of {}</title>\n\
        <meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\n\
        </head>\n<body>\n<h1>Index of {}</h1>\n<table>\n\
        <tr><th>Name</th><th>Size</th><th>Last modified</th></tr>\n\
        {}\
        </table>\n\
        <hr>\n\
        {}\
        </body>\n</html>\n",
        HtmlEscaped(&title),
        HtmlEscaped(&title),
        Listing {
            base: encode_path(&title),
            entries,
        },
        GeneratedOn(exchange.settings.server_id, SystemTime::now()),
    );
    Ok(Response::new(Status::OK).with_body(page.into_bytes(), HTML_CONTENT_TYPE))
}
