//! serverd: a single-threaded web server daemon. Every connection gets one request line read,
//! then the same fixed header and `index.html` from the document root, then close.

pub mod config;
pub mod daemon;
pub mod listener;
pub mod log;
pub mod poller;
pub mod request;
pub mod response;
pub mod server;
