//! A small HTTP/1.1 server: virtual hosts, static files, uploads, byte ranges, directory
//! listings, redirects and CGI, multiplexed on a single thread with `poll`.

pub mod cache;
pub mod cgi;
pub mod config;
pub mod http;
pub mod request;
pub mod response;
pub mod server;

/// Logs an error and exits with code 1.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => ({
        tracing::error!($($arg)*);
        std::process::exit(1);
    })
}
