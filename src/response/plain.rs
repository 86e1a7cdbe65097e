//! Static files: read, create, delete.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use tracing::debug;

use super::{is_blocked_upload, Exchange, Failure, Response};
use crate::http::{Method, Status};
use crate::request::Resolution;

pub(super) fn handle(exchange: &mut Exchange) -> Result<Response, Failure> {
    match exchange.method()? {
        Method::Get | Method::Head => get(exchange),
        Method::Post => post(exchange),
        Method::Delete => delete(exchange),
        Method::Options => options(exchange),
        method => Err(Failure::new(
            Status::NOT_IMPLEMENTED,
            format!("{} is not implemented", method),
        )),
    }
}

fn get(exchange: &mut Exchange) -> Result<Response, Failure> {
    let request = exchange.request;
    let path = &request.normalized_path;
    let body = match fs::read(path) {
        Ok(body) => body,
        Err(e) => {
            if request.from_cache {
                debug!(target: "cache", "dropping stale entry for {}", request.path);
                exchange.host.cache.remove(&request.path);
            }
            return Err(Failure::from_io(&e, &request.path));
        }
    };
    if request.method == Some(Method::Get) && !request.from_cache {
        if let Some(location) = &request.location {
            exchange.host.cache.put(
                request.path.clone(),
                Resolution {
                    location: location.clone(),
                    normalized_path: path.clone(),
                },
            );
        }
    }
    Ok(Response::new(Status::OK).with_body(body, exchange.mime_map.content_type(path)))
}

fn post(exchange: &mut Exchange) -> Result<Response, Failure> {
    let request = exchange.request;
    let path = &request.normalized_path;
    if path.ends_with('/') || Path::new(path).is_dir() {
        return Err(Failure::new(
            Status::CONFLICT,
            format!("{} is a directory", request.path),
        ));
    }
    if is_blocked_upload(path) {
        return Err(Failure::new(
            Status::UNSUPPORTED_MEDIA_TYPE,
            format!("uploads like {} are not accepted", request.path),
        ));
    }
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| Failure::from_io(&e, &request.path))?;
    file.write_all(&request.body)
        .map_err(|e| Failure::from_io(&e, &request.path))?;
    debug!(target: "response", "created {} ({} bytes)", path, request.body.len());
    Ok(Response::new(Status::CREATED).with_header("Location", &request.path))
}

fn delete(exchange: &mut Exchange) -> Result<Response, Failure> {
    let request = exchange.request;
    fs::remove_file(&request.normalized_path)
        .map_err(|e| Failure::from_io(&e, &request.path))?;
    exchange.host.cache.remove(&request.path);
    debug!(target: "response", "deleted {}", request.normalized_path);
    Ok(Response::new(Status::NO_CONTENT))
}

fn options(exchange: &mut Exchange) -> Result<Response, Failure> {
    let methods = exchange.location()?.methods;
    Ok(Response::new(Status::NO_CONTENT).with_header("Allow", methods.allow_header()))
}

#[cfg(test)]
mod test {
    use crate::http::Status;
    use crate::response::test::Fixture;

    const LOCATIONS: &str =
        "    locations:\n      \"/\": {methods: [GET, HEAD, POST, DELETE, OPTIONS, PUT]}\n";

    #[test]
    fn get_serves_file_and_fills_cache() {
        let mut fixture = Fixture::new(LOCATIONS);
        fixture.write("index.html", "<h1>hi</h1>");
        let (request, response) = fixture.respond(b"GET /index.html HTTP/1.1\r\n\r\n");
        assert!(!request.from_cache);
        assert_eq!(response.status, Status::OK);
        assert_eq!(response.body(), b"<h1>hi</h1>");
        assert_eq!(response.header("Content-Type"), Some("text/html"));
        assert_eq!(fixture.hosts[0].cache.len(), 1);

        let (request, cached) = fixture.respond(b"GET /index.html HTTP/1.1\r\n\r\n");
        assert!(request.from_cache);
        assert_eq!(cached.status, response.status);
        assert_eq!(cached.body(), response.body());
    }

    #[test]
    fn stale_cache_entry_is_dropped() {
        let mut fixture = Fixture::new(LOCATIONS);
        fixture.write("page.txt", "x");
        fixture.respond(b"GET /page.txt HTTP/1.1\r\n\r\n");
        std::fs::remove_file(fixture.path("page.txt")).unwrap();
        let (request, response) = fixture.respond(b"GET /page.txt HTTP/1.1\r\n\r\n");
        assert!(request.from_cache);
        assert_eq!(response.status, Status::NOT_FOUND);
        assert!(fixture.hosts[0].cache.is_empty());
    }

    #[test]
    fn post_creates_file_once() {
        let mut fixture = Fixture::new(LOCATIONS);
        let raw = b"POST /note.txt HTTP/1.1\r\nContent-Length: 4\r\n\r\nnote";
        let (_, response) = fixture.respond(raw);
        assert_eq!(response.status, Status::CREATED);
        assert_eq!(response.header("Location"), Some("/note.txt"));
        assert_eq!(std::fs::read(fixture.path("note.txt")).unwrap(), b"note");
        let (_, response) = fixture.respond(raw);
        assert_eq!(response.status, Status::CONFLICT);
    }

    #[test]
    fn post_rejects_directories_and_scripts() {
        let mut fixture = Fixture::new(LOCATIONS);
        std::fs::create_dir(fixture.path("dir")).unwrap();
        let (_, response) =
            fixture.respond(b"POST /dir HTTP/1.1\r\nContent-Length: 1\r\n\r\nx");
        assert_eq!(response.status, Status::CONFLICT);
        let (_, response) =
            fixture.respond(b"POST /evil.sh HTTP/1.1\r\nContent-Length: 1\r\n\r\nx");
        assert_eq!(response.status, Status::UNSUPPORTED_MEDIA_TYPE);
        assert!(!fixture.path("evil.sh").exists());
    }

    #[test]
    fn delete_removes_file() {
        let mut fixture = Fixture::new(LOCATIONS);
        fixture.write("old.txt", "bye");
        let (_, response) = fixture.respond(b"DELETE /old.txt HTTP/1.1\r\n\r\n");
        assert_eq!(response.status, Status::NO_CONTENT);
        assert!(!fixture.path("old.txt").exists());
        let (_, response) = fixture.respond(b"DELETE /old.txt HTTP/1.1\r\n\r\n");
        assert_eq!(response.status, Status::NOT_FOUND);
    }

    #[test]
    fn options_lists_allowed_methods() {
        let mut fixture = Fixture::new(LOCATIONS);
        fixture.write("index.html", "x");
        let (_, response) = fixture.respond(b"OPTIONS /index.html HTTP/1.1\r\n\r\n");
        assert_eq!(response.status, Status::NO_CONTENT);
        assert_eq!(
            response.header("Allow"),
            Some("GET, OPTIONS, HEAD, POST, PUT, DELETE")
        );
    }

    #[test]
    fn put_is_not_implemented() {
        let mut fixture = Fixture::new(LOCATIONS);
        fixture.write("index.html", "x");
        let (_, response) =
            fixture.respond(b"PUT /index.html HTTP/1.1\r\nContent-Length: 1\r\n\r\ny");
        assert_eq!(response.status, Status::NOT_IMPLEMENTED);
    }
}
