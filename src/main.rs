use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{anyhow, Context, Result};
use nix::sys::signal::{signal, SigHandler, Signal};
use tracing_subscriber::EnvFilter;

use webserv::config::Config;
use webserv::fatal;
use webserv::http::MimeMap;
use webserv::server::Reactor;

const DEFAULT_CONFIG: &str = "webserv.yaml";
const DEFAULT_LOG_LEVEL: &str = "info";

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn stop_running(_signal: libc::c_int) {
    RUNNING.store(false, Ordering::Relaxed);
}

#[derive(Debug)]
struct Options {
    config: PathBuf,
    log_level: String,
    mime_map: MimeMap,
    test_only: bool,
}

impl Options {
    fn from_command_line() -> Result<Self> {
        let mut options = Self {
            config: PathBuf::from(DEFAULT_CONFIG),
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            mime_map: MimeMap::default(),
            test_only: false,
        };
        let mut args = std::env::args();
        let name = args
            .next()
            .unwrap_or_else(|| env!("CARGO_PKG_NAME").to_string());
        while let Some(arg) = args.next().as_deref() {
            match arg {
                "--help" => {
                    usage(&name);
                    std::process::exit(0);
                }
                "--config" => {
                    options.config = args
                        .next()
                        .context("missing filename after --config")?
                        .into();
                }
                "--log-level" => {
                    options.log_level = args.next().context("missing level after --log-level")?;
                }
                "--mimetypes" => {
                    let filename = args.next().context("missing filename after --mimetypes")?;
                    options
                        .mime_map
                        .parse_extension_map_file(filename.as_ref())?;
                }
                "--default-mimetype" => {
                    let mimetype = args
                        .next()
                        .context("missing string after --default-mimetype")?;
                    options.mime_map.set_default_mimetype(&mimetype);
                }
                "--test" => options.test_only = true,
                _ => return Err(anyhow!("unknown argument `{}'", arg)),
            }
        }
        Ok(options)
    }
}

fn usage(argv0: &str) {
    print!(
        "usage:\t{} [flags]\n\n\
        flags:\t--config filename (default: {})\n\
        \t\tYAML file describing the servers to run.\n\n\
        \t--log-level level (default: {})\n\
        \t\tOne of error, warn, info, debug, trace. RUST_LOG overrides it.\n\n\
        \t--mimetypes filename (optional)\n\
        \t\tParses specified file for extension-MIME associations.\n\n\
        \t--default-mimetype string (optional, default: application/octet-stream)\n\
        \t\tFiles with unknown extensions are served as this mimetype.\n\n\
        \t--test\n\
        \t\tCheck the configuration and exit.\n\n",
        argv0, DEFAULT_CONFIG, DEFAULT_LOG_LEVEL,
    );
}

fn main() -> Result<()> {
    let options = Options::from_command_line()?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&options.log_level))
        .with_context(|| format!("invalid log level `{}'", options.log_level))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

    let config = match Config::from_file(&options.config) {
        Ok(config) => config,
        Err(e) => fatal!("{:#}", e),
    };
    if options.test_only {
        println!(
            "configuration file {} test is successful",
            options.config.display()
        );
        return Ok(());
    }

    // set signal handlers
    unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) }
        .context("failed to set SIGPIPE handler")?;
    unsafe { signal(Signal::SIGINT, SigHandler::Handler(stop_running)) }
        .context("failed to set SIGINT handler")?;
    unsafe { signal(Signal::SIGTERM, SigHandler::Handler(stop_running)) }
        .context("failed to set SIGTERM handler")?;

    let mut reactor = match Reactor::new(config, options.mime_map) {
        Ok(reactor) => reactor,
        Err(e) => fatal!("{:#}", e),
    };

    // main loop
    let result = reactor.run(&RUNNING);
    reactor.shutdown()?;
    if !reactor.is_healthy() {
        return result.context("server became unhealthy");
    }
    result
}
