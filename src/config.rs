//! Configuration model and YAML loader.
//!
//! The reactor and everything below it treat a loaded `Config` as immutable.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::http::{Method, Status};

pub const DEFAULT_INDEX_NAME: &str = "index.html";
const DEFAULT_CGI_EXTENSIONS: &[&str] = &[".py", ".pl"];
const DEFAULT_MAX_BODY_SIZE: usize = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorMode {
    /// Serve the configured page unmodified.
    Literal,
    /// Substitute `{error_code}` and `{error_detail}` in the configured page.
    Template,
}

impl Default for ErrorMode {
    fn default() -> Self {
        ErrorMode::Literal
    }
}

/// Set of allowed request methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "Vec<String>")]
pub struct Methods(u8);

impl Methods {
    pub fn empty() -> Self {
        Methods(0)
    }

    pub fn with(self, method: Method) -> Self {
        Methods(self.0 | method.mask())
    }

    pub fn allows(self, method: Method) -> bool {
        self.0 & method.mask() != 0
    }

    /// Comma separated method list for an `Allow` header.
    pub fn allow_header(self) -> String {
        Method::ALL
            .iter()
            .filter(|method| self.allows(**method))
            .map(|method| method.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl Default for Methods {
    fn default() -> Self {
        Methods::empty().with(Method::Get).with(Method::Head)
    }
}

impl TryFrom<Vec<String>> for Methods {
    type Error = String;

    fn try_from(names: Vec<String>) -> Result<Self, Self::Error> {
        names.iter().try_fold(Methods::empty(), |methods, name| {
            name.to_ascii_uppercase()
                .parse::<Method>()
                .map(|method| methods.with(method))
                .map_err(|_| format!("unknown method `{}`", name))
        })
    }
}

/// Global settings shared by every listener.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub client_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub cgi_timeout_ms: u64,
    pub cache_capacity: usize,
    pub max_header_size: usize,
    pub max_uri_length: usize,
    pub keep_alive: bool,
    pub server_id: bool,
}

impl Settings {
    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn cgi_timeout(&self) -> Duration {
        Duration::from_millis(self.cgi_timeout_ms)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            client_timeout_secs: 10,
            request_timeout_secs: 10,
            cgi_timeout_ms: 5000,
            cache_capacity: 100,
            max_header_size: 8192,
            max_uri_length: 2048,
            keep_alive: true,
            server_id: true,
        }
    }
}

/// A script found under a CGI location at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgiScript {
    pub dir: String,
    pub script: String,
}

impl CgiScript {
    pub fn path(&self) -> String {
        format!("{}/{}", self.dir, self.script)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LocationConfig {
    #[serde(skip)]
    pub path: String,
    #[serde(default)]
    pub root: Option<String>,
    #[serde(default)]
    pub methods: Methods,
    #[serde(default)]
    pub default_pages: Vec<String>,
    #[serde(default)]
    pub error_mode: Option<ErrorMode>,
    #[serde(default)]
    pub error_pages: BTreeMap<u16, String>,
    #[serde(default)]
    pub autoindex: Option<bool>,
    #[serde(default)]
    pub cgi: bool,
    #[serde(default = "default_cgi_extensions")]
    pub cgi_extensions: Vec<String>,
    #[serde(default)]
    pub redirect: BTreeMap<u16, String>,
    /// Extension-less URL path to script, filled in at startup.
    #[serde(skip)]
    pub cgi_scripts: BTreeMap<String, CgiScript>,
    /// True when the location serves straight out of the server root.
    #[serde(skip)]
    pub is_root: bool,
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            path: "/".to_string(),
            root: None,
            methods: Methods::default(),
            default_pages: Vec::new(),
            error_mode: None,
            error_pages: BTreeMap::new(),
            autoindex: None,
            cgi: false,
            cgi_extensions: default_cgi_extensions(),
            redirect: BTreeMap::new(),
            cgi_scripts: BTreeMap::new(),
            is_root: true,
        }
    }
}

impl LocationConfig {
    pub fn root(&self) -> &str {
        self.root.as_deref().unwrap_or("")
    }

    pub fn error_mode(&self) -> ErrorMode {
        self.error_mode.unwrap_or_default()
    }

    pub fn autoindex(&self) -> bool {
        self.autoindex.unwrap_or(false)
    }

    /// Map a request path under this location to a filesystem path.
    pub fn map_path(&self, url_path: &str) -> String {
        if self.is_root {
            return format!("{}{}", self.root(), url_path);
        }
        let rest = url_path.get(self.path.len()..).unwrap_or("");
        if rest.is_empty() || rest.starts_with('/') {
            format!("{}{}", self.root(), rest)
        } else {
            format!("{}/{}", self.root(), rest)
        }
    }

    pub fn is_cgi_file(&self, path: &str) -> bool {
        self.cgi_extensions
            .iter()
            .any(|extension| path.len() > extension.len() && path.ends_with(extension.as_str()))
    }

    /// Find the mapped script whose URL path is the longest prefix of `url_path`, on a path
    /// segment boundary. Returns the key and the script.
    pub fn cgi_script_for(&self, url_path: &str) -> Option<(&str, &CgiScript)> {
        self.cgi_scripts
            .iter()
            .filter(|(key, _)| {
                url_path.starts_with(key.as_str())
                    && matches!(url_path.as_bytes().get(key.len()), None | Some(b'/'))
            })
            .max_by_key(|(key, _)| key.len())
            .map(|(key, script)| (key.as_str(), script))
    }

    fn finalize(&mut self, path: &str, server: &ServerConfig) -> Result<()> {
        if !path.starts_with('/') {
            bail!("location `{}` must start with `/`", path);
        }
        self.path = path.to_string();
        self.root = Some(match self.root.take() {
            None => server.root.clone(),
            Some(root) if root.starts_with('/') => root.trim_end_matches('/').to_string(),
            Some(root) => format!("{}/{}", server.root, root.trim_matches('/')),
        });
        self.is_root = self.root() == server.root;
        if self.default_pages.is_empty() {
            self.default_pages = server.default_pages.clone();
        }
        for (status, page) in &server.error_pages {
            self.error_pages
                .entry(*status)
                .or_insert_with(|| page.clone());
        }
        self.error_mode.get_or_insert(server.error_mode);
        self.autoindex.get_or_insert(server.autoindex);
        for code in self.redirect.keys() {
            if !Status(*code).is_redirection() {
                bail!("location `{}`: redirect status {} is not 3xx", path, code);
            }
        }
        for extension in &mut self.cgi_extensions {
            if !extension.starts_with('.') {
                extension.insert(0, '.');
            }
        }
        if self.cgi {
            self.map_cgi_scripts();
        }
        Ok(())
    }

    fn map_cgi_scripts(&mut self) {
        let dir = self.map_path(&self.path);
        let mut scripts = BTreeMap::new();
        self.scan_cgi_dir(Path::new(&dir), Path::new(&dir), &mut scripts);
        for (url, script) in &scripts {
            debug!(target: "config", "mapped CGI path {} to {}", url, script.path());
        }
        self.cgi_scripts = scripts;
    }

    fn scan_cgi_dir(&self, base: &Path, dir: &Path, scripts: &mut BTreeMap<String, CgiScript>) {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(target: "config", "cannot scan CGI directory {}: {}", dir.display(), e);
                return;
            }
        };
        for entry in entries.filter_map(|entry| entry.ok()) {
            let path = entry.path();
            let metadata = match fs::metadata(&path) {
                Ok(metadata) => metadata,
                Err(_) => continue,
            };
            if metadata.is_dir() {
                self.scan_cgi_dir(base, &path, scripts);
                continue;
            }
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if !metadata.is_file() || !self.is_cgi_file(&file_name) {
                continue;
            }
            let relative = match path.strip_prefix(base) {
                Ok(relative) => relative.with_extension(""),
                Err(_) => continue,
            };
            let url = format!(
                "{}/{}",
                self.path.trim_end_matches('/'),
                relative.to_string_lossy()
            );
            scripts.insert(
                url,
                CgiScript {
                    dir: dir.to_string_lossy().into_owned(),
                    script: file_name,
                },
            );
        }
    }
}

fn default_cgi_extensions() -> Vec<String> {
    DEFAULT_CGI_EXTENSIONS.iter().map(|e| e.to_string()).collect()
}

/// One virtual host.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: IpAddr,
    #[serde(default)]
    pub server_name: Vec<String>,
    pub root: String,
    #[serde(default = "default_pages")]
    pub default_pages: Vec<String>,
    #[serde(default)]
    pub error_mode: ErrorMode,
    #[serde(default)]
    pub error_pages: BTreeMap<u16, String>,
    #[serde(default)]
    pub template_error_page: Option<String>,
    #[serde(default = "default_max_body_size")]
    pub client_max_body_size: usize,
    #[serde(default)]
    pub autoindex: bool,
    #[serde(default)]
    pub locations: BTreeMap<String, LocationConfig>,
}

fn default_bind() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_pages() -> Vec<String> {
    vec![DEFAULT_INDEX_NAME.to_string()]
}

fn default_max_body_size() -> usize {
    DEFAULT_MAX_BODY_SIZE
}

impl ServerConfig {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    /// True if this host answers to `name`. A host without names answers to anything.
    pub fn answers_to(&self, name: &str) -> bool {
        self.server_name.is_empty() || self.server_name.iter().any(|n| n == name)
    }

    /// Longest-prefix match over the location table.
    pub fn location_for(&self, path: &str) -> Option<&LocationConfig> {
        self.locations
            .iter()
            .filter(|(prefix, _)| {
                path.starts_with(prefix.as_str())
                    && (prefix.ends_with('/')
                        || matches!(path.as_bytes().get(prefix.len()), None | Some(b'/')))
            })
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, location)| location)
    }

    /// Filesystem path of an error page or other root-relative file.
    pub fn resolve_page(&self, page: &str) -> String {
        if page.starts_with('/') && Path::new(page).exists() {
            page.to_string()
        } else {
            format!("{}/{}", self.root, page.trim_start_matches('/'))
        }
    }

    fn finalize(&mut self) -> Result<()> {
        self.root = self.root.trim_end_matches('/').to_string();
        if self.root.is_empty() {
            self.root = "/".to_string();
        }
        let metadata = fs::metadata(&self.root)
            .with_context(|| format!("failed to access document root {}", self.root))?;
        if !metadata.is_dir() {
            bail!("document root {} is not a directory", self.root);
        }
        for name in &mut self.server_name {
            *name = name.to_ascii_lowercase();
        }
        if self.locations.is_empty() {
            self.locations
                .insert("/".to_string(), LocationConfig::default());
        }
        let mut locations = std::mem::take(&mut self.locations);
        for (path, location) in &mut locations {
            location
                .finalize(path, self)
                .with_context(|| format!("invalid location `{}` on port {}", path, self.port))?;
        }
        self.locations = locations;
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub settings: Settings,
    pub servers: Vec<ServerConfig>,
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read configuration file {}", path.display()))?;
        Self::from_yaml_str(&text)
            .with_context(|| format!("invalid configuration file {}", path.display()))
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let mut config: Config =
            serde_yaml::from_str(text).context("failed to parse configuration")?;
        config.finalize()?;
        Ok(config)
    }

    fn finalize(&mut self) -> Result<()> {
        if self.servers.is_empty() {
            bail!("no servers configured");
        }
        let mut seen = HashSet::new();
        for server in &mut self.servers {
            server.finalize()?;
            let names = if server.server_name.is_empty() {
                vec![String::new()]
            } else {
                server.server_name.clone()
            };
            for name in names {
                if !seen.insert((server.socket_addr(), name.clone())) {
                    bail!(
                        "duplicate server `{}` on {}",
                        name,
                        server.socket_addr()
                    );
                }
            }
        }
        Ok(())
    }
}
