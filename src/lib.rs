//! # wicket
//!
//! An embeddable async HTTP/1.1 server engine: regex routing, keep-alive,
//! fixed-length and chunked request bodies, per-stage timeouts and an
//! optional TLS transport.
//!
//! Handlers are plain synchronous closures that fill in a [`Response`]; the
//! engine takes care of reading, framing and sending.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use wicket::{Config, Headers, HttpServer, Request, Response, Router};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut router = Router::new();
//!     router.get("/users/([0-9]+)", |req: &mut Request, res: &mut Response| {
//!         let id = req.path_match(1).unwrap_or_default().to_owned();
//!         res.write_ok(format!("user {id}"), &Headers::new());
//!     })?;
//!
//!     let server = HttpServer::new(Config::new(8080), router)
//!         .on_error(|req, err| eprintln!("{:?}: {err}", req.map(|r| r.path())));
//!     server.start()?;
//!     Ok(())
//! }
//! ```

pub mod http;
pub mod router;
pub mod server;

pub use http::{Headers, Method, Request, Response, StatusCode, Version};
pub use router::{Router, RouterError};
pub use server::{
    Config, ErrorKind, HttpServer, HttpsServer, ServeError, Server, ServerError, TlsError,
};
