//! Responses produced by CGI scripts.

use std::env;
use std::path::Path;

use super::{Exchange, Failure, Response};
use crate::cgi::{execute, CgiJob};
use crate::http::{find, Status};

pub(super) fn handle(exchange: &mut Exchange) -> Result<Response, Failure> {
    let request = exchange.request;
    let job = CgiJob {
        script: Path::new(&request.normalized_path),
        env: environment(exchange)?,
        input: &request.body,
        timeout: exchange.settings.cgi_timeout(),
    };
    let output = execute(&job).map_err(|e| Failure::new(e.status(), e))?;
    parse_output(&output)
}

/// CGI/1.1 meta-variables for the script.
fn environment(exchange: &Exchange) -> Result<Vec<(String, String)>, Failure> {
    let request = exchange.request;
    let config = &exchange.host.config;
    let content_type = if request.boundary.is_empty() {
        request.content_type.clone()
    } else {
        format!("{}; boundary={}", request.content_type, request.boundary)
    };
    let script_name = request
        .path
        .strip_suffix(request.path_info.as_str())
        .unwrap_or(&request.path);
    let server_name = match request.host.split(':').next().map(str::trim) {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => config
            .server_name
            .first()
            .cloned()
            .unwrap_or_else(|| config.bind.to_string()),
    };
    let protocol = if request.http10 { "HTTP/1.0" } else { "HTTP/1.1" };

    let mut vars = vec![
        ("GATEWAY_INTERFACE", "CGI/1.1".to_string()),
        ("SERVER_PROTOCOL", protocol.to_string()),
        (
            "SERVER_SOFTWARE",
            format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
        ),
        ("REQUEST_METHOD", exchange.method()?.to_string()),
        ("QUERY_STRING", request.query.clone()),
        ("CONTENT_TYPE", content_type),
        ("CONTENT_LENGTH", request.body.len().to_string()),
        ("PATH_INFO", request.path_info.clone()),
        ("SCRIPT_NAME", script_name.to_string()),
        ("SCRIPT_FILENAME", request.normalized_path.clone()),
        ("SERVER_NAME", server_name),
        ("SERVER_PORT", config.port.to_string()),
        ("HTTP_COOKIE", request.cookie.clone()),
    ];
    if let Some(path) = env::var_os("PATH") {
        vars.push(("PATH", path.to_string_lossy().into_owned()));
    }
    Ok(vars
        .into_iter()
        .map(|(name, value)| (name.to_string(), value))
        .collect())
}

fn bad_gateway(detail: impl std::fmt::Display) -> Failure {
    Failure::new(Status::BAD_GATEWAY, format!("bad CGI output: {}", detail))
}

/// Turn a script's header block and body into a response.
fn parse_output(output: &[u8]) -> Result<Response, Failure> {
    if output.is_empty() {
        return Err(bad_gateway("script wrote nothing"));
    }
    let (head_end, separator_len) = match (find(b"\r\n\r\n", output), find(b"\n\n", output)) {
        (Some(crlf), Some(lf)) if lf < crlf => (lf, 2),
        (Some(crlf), _) => (crlf, 4),
        (None, Some(lf)) => (lf, 2),
        (None, None) => return Err(bad_gateway("no header block")),
    };
    let head = String::from_utf8_lossy(&output[..head_end]);

    let mut response = Response::new(Status::OK);
    let mut keep_alive = false;
    let mut has_content_type = false;
    for line in head.lines() {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| bad_gateway(format!("malformed header line `{}`", line)))?;
        let (name, value) = (name.trim(), value.trim());
        if name.eq_ignore_ascii_case("Status") {
            response.status = value
                .split_whitespace()
                .next()
                .and_then(|code| code.parse().ok())
                .map(Status)
                .filter(|status| status.reason().is_some())
                .ok_or_else(|| bad_gateway(format!("unrecognized status `{}`", value)))?;
        } else if name.eq_ignore_ascii_case("Connection") {
            keep_alive = value.eq_ignore_ascii_case("keep-alive");
        } else if !name.eq_ignore_ascii_case("Content-Length") {
            has_content_type |= name.eq_ignore_ascii_case("Content-Type");
            response = response.with_header(name, value);
        }
    }
    if !has_content_type {
        return Err(bad_gateway("missing Content-Type"));
    }
    response.body = output[head_end + separator_len..].to_vec();
    response.close = !keep_alive;
    Ok(response)
}

#[cfg(test)]
mod test {
    use super::*;

    use std::fs::{set_permissions, Permissions};
    use std::os::unix::fs::PermissionsExt;

    use tempfile::tempdir;
    use test_case::test_case;

    use crate::response::test::Fixture;

    #[test]
    fn forwards_script_headers() {
        let response = parse_output(
            b"Status: 404 Not Found\r\nContent-Type: text/plain\r\nX-Script: yes\r\nContent-Length: 999\r\n\r\nnot found",
        )
        .unwrap();
        assert_eq!(response.status, Status::NOT_FOUND);
        assert_eq!(response.header("Content-Type"), Some("text/plain"));
        assert_eq!(response.header("X-Script"), Some("yes"));
        assert_eq!(response.header("Content-Length"), None);
        assert_eq!(response.body(), b"not found");
        assert!(response.close);
    }

    #[test]
    fn accepts_bare_newlines_and_keep_alive() {
        let response =
            parse_output(b"Content-Type: text/html\nConnection: keep-alive\n\n<p>hi</p>\n").unwrap();
        assert_eq!(response.status, Status::OK);
        assert_eq!(response.body(), b"<p>hi</p>\n");
        assert!(!response.close);
    }

    #[test_case(b"" ; "empty output")]
    #[test_case(b"Content-Type: text/plain" ; "no header terminator")]
    #[test_case(b"X-Thing: 1\r\n\r\nbody" ; "no content type")]
    #[test_case(b"Status: 299\r\nContent-Type: text/plain\r\n\r\n" ; "unknown status")]
    #[test_case(b"Status: soon\r\nContent-Type: text/plain\r\n\r\n" ; "non numeric status")]
    #[test_case(b"garbage\r\n\r\nbody" ; "malformed line")]
    fn rejects_bad_output(output: &[u8]) {
        assert_eq!(parse_output(output).unwrap_err().status, Status::BAD_GATEWAY);
    }

    fn cgi_fixture(scripts: &[(&str, &str)]) -> Fixture {
        let root = tempdir().unwrap();
        std::fs::create_dir(root.path().join("cgi")).unwrap();
        for (name, body) in scripts {
            let path = root.path().join("cgi").join(name);
            std::fs::write(&path, format!("#!/bin/sh\n{}", body)).unwrap();
            set_permissions(&path, Permissions::from_mode(0o755)).unwrap();
        }
        Fixture::with_root(
            root,
            "    locations:\n      \"/\": {}\n      \"/cgi\": {cgi: true, methods: [GET, POST]}\n",
        )
    }

    #[test]
    fn script_status_is_used() {
        let mut fixture = cgi_fixture(&[(
            "status.py",
            "printf 'Status: 404\\r\\nContent-Type: text/plain\\r\\n\\r\\nnot found'\n",
        )]);
        let (_, response) = fixture.respond(b"GET /cgi/status.py HTTP/1.1\r\n\r\n");
        assert_eq!(response.status, Status::NOT_FOUND);
        assert_eq!(response.body(), b"not found");
    }

    #[test]
    fn exports_request_metadata() {
        let mut fixture = cgi_fixture(&[(
            "env.py",
            "printf 'Content-Type: text/plain\\r\\n\\r\\n'\nprintf '%s|%s|%s|%s|%s' \"$QUERY_STRING\" \"$PATH_INFO\" \"$SCRIPT_NAME\" \"$HTTP_COOKIE\" \"$SERVER_NAME\"\n",
        )]);
        let (_, response) = fixture.respond(
            b"GET /cgi/env/extra?x=1 HTTP/1.1\r\nHost: example.org:8080\r\nCookie: id=7\r\n\r\n",
        );
        assert_eq!(response.status, Status::OK);
        assert_eq!(response.body(), b"x=1|/extra|/cgi/env|id=7|example.org");
    }

    #[test]
    fn body_reaches_script() {
        let mut fixture = cgi_fixture(&[(
            "echo.py",
            "printf 'Content-Type: text/plain\\r\\n\\r\\n%s:' \"$CONTENT_LENGTH\"\ncat\n",
        )]);
        let (_, response) = fixture.respond(
            b"POST /cgi/echo HTTP/1.1\r\nContent-Type: text/plain\r\nContent-Length: 5\r\n\r\nhello",
        );
        assert_eq!(response.body(), b"5:hello");
    }

    #[test]
    fn hanging_script_times_out() {
        let mut fixture = cgi_fixture(&[("hang.py", "exec sleep 30\n")]);
        fixture.settings.cgi_timeout_ms = 200;
        let (_, response) = fixture.respond(b"GET /cgi/hang.py HTTP/1.1\r\n\r\n");
        assert_eq!(response.status, Status::GATEWAY_TIMEOUT);
    }
}
