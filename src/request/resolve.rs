//! Mapping a request path onto a location and a filesystem resource.

use std::fs;
use std::path::Path;

use tracing::debug;
use url::Url;

use super::Request;
use crate::config::{LocationConfig, ServerConfig};
use crate::http::{make_safe_url, url_decode, Method, Status};
use crate::response::Failure;
use crate::server::VirtualHost;

/// Cached outcome of resolving a GET path on one virtual host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub location: String,
    pub normalized_path: String,
}

impl Request {
    pub(super) fn resolve_resource(&mut self, hosts: &mut [VirtualHost]) -> bool {
        let host = match self.vhost {
            Some(index) if index < hosts.len() => &mut hosts[index],
            _ => {
                self.fail(Status::INTERNAL_SERVER_ERROR, "no virtual host resolved");
                return false;
            }
        };
        if self.method == Some(Method::Get) {
            if let Some(hit) = host.cache.get(&self.path) {
                debug!(target: "cache", "hit {} -> {}", self.path, hit.normalized_path);
                self.location = Some(hit.location);
                self.normalized_path = hit.normalized_path;
                self.from_cache = true;
                return true;
            }
        }

        let mut result = self.resolve_location(&host.config);
        let missing = matches!(&result, Err(failure) if failure.status == Status::NOT_FOUND);
        if missing && !self.referer.is_empty() {
            if let Some(path) = referer_relative_path(&self.referer, &self.path) {
                if path != self.path {
                    debug!(target: "request", "retrying {} as {} relative to referer", self.path, path);
                    let original = std::mem::replace(&mut self.path, path);
                    self.clear_resolution();
                    result = self.resolve_location(&host.config);
                    if result.is_err() {
                        self.path = original;
                    }
                }
            }
        }
        match result {
            Ok(()) => true,
            Err(failure) => {
                self.clear_resolution();
                self.fail(failure.status, failure.detail);
                false
            }
        }
    }

    fn clear_resolution(&mut self) {
        self.location = None;
        self.normalized_path.clear();
        self.script.clear();
        self.path_info.clear();
        if self.cgi {
            self.factory -= 1;
        }
        if self.autoindex {
            self.factory -= 1;
        }
        if self.redirect {
            self.factory -= 1;
        }
        self.cgi = false;
        self.autoindex = false;
        self.redirect = false;
    }

    fn resolve_location(&mut self, config: &ServerConfig) -> Result<(), Failure> {
        let location = config.location_for(&self.path).ok_or_else(|| {
            Failure::new(Status::NOT_FOUND, format!("no location matches {}", self.path))
        })?;
        self.location = Some(location.path.clone());
        if !location.redirect.is_empty() {
            self.redirect = true;
            self.factory += 1;
            return Ok(());
        }
        if self.detect_cgi(location) {
            return Ok(());
        }
        self.normalize_path(location)
    }

    fn detect_cgi(&mut self, location: &LocationConfig) -> bool {
        let fs_path = location.map_path(&self.path);
        if !self.path.ends_with('/') && is_file(&fs_path) && location.is_cgi_file(&fs_path) {
            self.mark_cgi(fs_path, String::new());
            return true;
        }
        if !location.cgi {
            return false;
        }
        match location.cgi_script_for(&self.path) {
            Some((key, script)) => {
                let path_info = self.path[key.len()..].to_string();
                self.mark_cgi(script.path(), path_info);
                true
            }
            None => false,
        }
    }

    fn mark_cgi(&mut self, script_path: String, path_info: String) {
        self.script = script_path
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string();
        self.normalized_path = script_path;
        self.path_info = path_info;
        self.cgi = true;
        self.factory += 1;
    }

    fn normalize_path(&mut self, location: &LocationConfig) -> Result<(), Failure> {
        let mut path = location.map_path(&self.path);
        let method = self.method.unwrap_or(Method::Get);
        let metadata = fs::metadata(&path).ok();
        let is_dir = metadata.as_ref().map_or(false, |metadata| metadata.is_dir());

        if method == Method::Post {
            if is_dir {
                if !path.ends_with('/') {
                    path.push('/');
                }
            } else if metadata.is_none() && !parent_is_dir(&path) {
                return Err(Failure::new(
                    Status::NOT_FOUND,
                    format!("no directory to create {} in", self.path),
                ));
            }
            self.normalized_path = path;
            return Ok(());
        }

        if metadata.as_ref().map_or(false, |metadata| metadata.is_file()) {
            self.normalized_path = path;
            return Ok(());
        }
        if !is_dir {
            return Err(Failure::new(
                Status::NOT_FOUND,
                format!("{} does not exist", self.path),
            ));
        }
        if method == Method::Delete {
            return Err(Failure::new(
                Status::METHOD_NOT_ALLOWED,
                "directories cannot be deleted",
            ));
        }
        if !path.ends_with('/') {
            path.push('/');
        }
        for page in &location.default_pages {
            let candidate = format!("{}{}", path, page);
            if is_file(&candidate) {
                if location.is_cgi_file(&candidate) {
                    self.mark_cgi(candidate, String::new());
                } else {
                    self.normalized_path = candidate;
                }
                return Ok(());
            }
        }
        if location.autoindex() && matches!(method, Method::Get | Method::Head) {
            self.autoindex = true;
            self.factory += 1;
            self.normalized_path = path;
            return Ok(());
        }
        Err(Failure::new(
            Status::NOT_FOUND,
            format!("{} has no index page", self.path),
        ))
    }
}

fn is_file(path: &str) -> bool {
    fs::metadata(path).map_or(false, |metadata| metadata.is_file())
}

fn parent_is_dir(path: &str) -> bool {
    Path::new(path)
        .parent()
        .map_or(false, |parent| parent.is_dir())
}

/// Reinterpret a request path relative to the page that referred to it.
fn referer_relative_path(referer: &str, path: &str) -> Option<String> {
    let relative = path.trim_start_matches('/');
    if relative.is_empty() {
        return None;
    }
    let joined = Url::parse(referer).ok()?.join(relative).ok()?;
    make_safe_url(&url_decode(joined.path()))
}

#[cfg(test)]
mod test {
    use super::*;

    use test_case::test_case;

    #[test_case("http://example.com/assets/page.html", "/style.css", Some("/assets/style.css") ; "sibling of referring page")]
    #[test_case("http://example.com/a/b/", "/img/x.png", Some("/a/b/img/x.png") ; "nested directory")]
    #[test_case("http://example.com/page.html", "/", None ; "root path")]
    #[test_case("not a url", "/x.css", None ; "invalid referer")]
    #[test_case("http://example.com/a%20b/page.html", "/c.css", Some("/a b/c.css") ; "percent encoded referer")]
    fn referer_paths(referer: &str, path: &str, expected: Option<&str>) {
        assert_eq!(
            referer_relative_path(referer, path).as_deref(),
            expected
        );
    }
}
