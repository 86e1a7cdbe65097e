#![allow(dead_code)]

use std::collections::HashMap;
use std::fs::{create_dir_all, set_permissions, write, File, Permissions};
use std::io;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::sleep;
use std::time::Duration;
use tempfile::{tempdir, TempDir};

#[macro_export]
macro_rules! map {
    ($($k:expr => $v:expr),* $(,)?) => {
        std::iter::Iterator::collect(IntoIterator::into_iter([$(($k, $v),)*]))
    };
}

fn get_unused_port() -> Option<u16> {
    TcpListener::bind(("127.0.0.1", 0))
        .ok()
        .map(|listener| listener.local_addr().unwrap().port())
}

fn wait_for_port(port: u16) -> bool {
    for _ in 0..1000 {
        if TcpStream::connect(("127.0.0.1", port)).is_ok() {
            return true;
        }
        sleep(Duration::from_millis(5));
    }
    false
}

struct ScopedChild(Child);

impl Drop for ScopedChild {
    fn drop(&mut self) {
        self.0.kill().ok();
        self.0.wait().ok();
    }
}

impl From<Child> for ScopedChild {
    fn from(child: Child) -> Self {
        ScopedChild(child)
    }
}

/// Document root and configuration directory for a server that has not started yet.
pub struct Site {
    root: TempDir,
    config_dir: TempDir,
}

impl Site {
    pub fn new() -> Self {
        Self {
            root: tempdir().expect("failed to create tempdir"),
            config_dir: tempdir().expect("failed to create tempdir"),
        }
    }
    pub fn root(&self) -> &Path {
        self.root.path()
    }
    pub fn path(&self, name: &str) -> PathBuf {
        self.root().join(name)
    }
    /// A path outside the document root.
    pub fn config_path(&self, name: &str) -> PathBuf {
        self.config_dir.path().join(name)
    }
    pub fn create_dir(&self, name: &str) {
        create_dir_all(self.path(name)).expect("failed to create directory");
    }
    pub fn create_file(&self, name: &str) -> File {
        File::create(self.path(name)).expect("failed to create file")
    }
    pub fn write_file(&self, name: &str, contents: impl AsRef<[u8]>) {
        write(self.path(name), contents).expect("failed to write file");
    }
    /// Write an executable shell script.
    pub fn create_script(&self, name: &str, body: &str) {
        let path = self.path(name);
        write(&path, format!("#!/bin/sh\n{}", body)).expect("failed to write script");
        set_permissions(&path, Permissions::from_mode(0o755)).expect("failed to chmod script");
    }
    /// Start the server. `settings` is the body of the YAML `settings` mapping, `server` holds
    /// extra keys for the single server block, indented by four spaces.
    pub fn start(self, settings: &str, server: &str, args: &[&str]) -> Server {
        // Get an unused port. Assumes the port won't be reused before the server binds it.
        let port = get_unused_port().expect("failed to get unused port");

        let config = self.config_dir.path().join("webserv.yaml");
        write(
            &config,
            format!(
                "settings: {{{}}}\nservers:\n  - port: {}\n    bind: 127.0.0.1\n    root: {}\n{}",
                settings,
                port,
                self.root().display(),
                server
            ),
        )
        .expect("failed to write configuration");

        let child = Command::new(env!("CARGO_BIN_EXE_webserv"))
            .arg("--config")
            .arg(&config)
            .args(&["--log-level", "error"])
            .args(args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("failed to spawn webserv")
            .into();

        // Create server early so it will be dropped if it fails to start.
        let server = Server {
            _child: child,
            port,
            site: self,
        };

        // Wait until the socket is open.
        assert!(wait_for_port(port), "failed to connect to webserv");

        server
    }
}

pub struct Server {
    _child: ScopedChild,
    port: u16,
    pub site: Site,
}

impl Server {
    pub fn root(&self) -> &Path {
        self.site.root()
    }
    pub fn stream(&self) -> TcpStream {
        let stream =
            TcpStream::connect(("127.0.0.1", self.port)).expect("failed to connect to webserv");
        // Set timeouts to prevent tests from hanging
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
            .set_write_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }
    /// Send raw request bytes on a fresh connection and read one response.
    pub fn request(&self, raw: &[u8]) -> Response {
        let mut stream = self.stream();
        stream.write_all(raw).unwrap();
        Response::from_reader(&mut stream).expect("failed to read response")
    }
    pub fn get(&self, path: &str, headers: HashMap<&str, &str>) -> Response {
        let mut request = format!("GET {} HTTP/1.1\r\n", path);
        for (header_name, header_value) in headers {
            request.push_str(&format!("{}: {}\r\n", header_name, header_value));
        }
        request.push_str("\r\n");
        self.request(request.as_bytes())
    }
}

/// HTTP Response from webserv.
pub struct Response {
    response_line: String,
    headers: HashMap<String, String>,
    pub body: Option<Vec<u8>>,
}

impl Response {
    pub fn from_reader<R: Read>(reader: &mut R) -> io::Result<Self> {
        let response_line = Self::read_header(reader)?;
        let headers = Self::read_headers(reader)?;
        let body = headers
            .get("Content-Length")
            .map(|length| length.parse::<usize>().expect("invalid content length"))
            .map(|length| Self::read_body(reader, length))
            .transpose()?;
        Ok(Self {
            response_line,
            headers,
            body,
        })
    }
    fn read_headers<R: Read>(reader: &mut R) -> io::Result<HashMap<String, String>> {
        let mut headers = HashMap::new();
        loop {
            let header_line = Self::read_header(reader)?;
            if header_line.is_empty() {
                break;
            }
            let (key, value) = header_line.split_once(": ").expect("invalid header");
            headers.insert(key.to_string(), value.to_string());
        }
        Ok(headers)
    }
    fn read_header<R: Read>(reader: &mut R) -> io::Result<String> {
        read_until_slice(reader, b"\r\n")
            .map(|vec| String::from_utf8(vec).expect("response header is not valid UTF-8"))
    }
    fn read_body<R: Read>(reader: &mut R, content_length: usize) -> io::Result<Vec<u8>> {
        let mut body = vec![0; content_length];
        reader.read_exact(&mut body)?;
        Ok(body)
    }
    pub fn status(&self) -> &str {
        self.response_line
            .split_once(' ')
            .map(|(_, status)| status)
            .expect("invalid response line")
    }
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(|name| name.as_str())
    }
    pub fn text(&self) -> Option<&str> {
        self.body
            .as_ref()
            .map(|body| std::str::from_utf8(body).expect("body is not valid UTF-8"))
    }
}

fn read_until_slice<R: Read>(reader: &mut R, separator: &[u8]) -> io::Result<Vec<u8>> {
    let mut byte = [0; 1];
    let mut buf = Vec::new();
    loop {
        reader.read_exact(&mut byte)?;
        buf.push(byte[0]);
        if buf.as_slice().ends_with(separator) {
            buf.truncate(buf.len() - separator.len());
            return Ok(buf);
        }
    }
}

/// Build a `multipart/form-data` body with one file part per entry.
pub fn multipart_body(boundary: &str, files: &[(&str, &str, &str)]) -> Vec<u8> {
    let mut body = Vec::new();
    for (name, filename, contents) in files {
        write!(
            body,
            "--{}\r\nContent-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n\
            Content-Type: text/plain\r\n\r\n{}\r\n",
            boundary, name, filename, contents
        )
        .unwrap();
    }
    write!(body, "--{}--\r\n", boundary).unwrap();
    body
}
