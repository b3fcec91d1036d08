//! Minimal server: `cargo run --example hello`, then
//! `curl 'http://127.0.0.1:8080/hello?name=you'`.
//!
//! Set `RUST_LOG=wicket=debug` to watch the pipeline.

use std::sync::Arc;
use std::thread;

use tracing_subscriber::EnvFilter;
use wicket::{Config, Headers, HttpServer, Request, Response, Router, StatusCode};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut router = Router::new();
    router
        .get("/hello", |req: &mut Request, res: &mut Response| {
            let query = req.parse_query_string();
            let name = query.get("name").unwrap_or("world");
            res.write_ok(format!("Hello, {name}!\n"), &Headers::new().with("Content-Type", "text/plain"));
        })?
        .get("/users/([0-9]+)", |req: &mut Request, res: &mut Response| {
            let id = req.path_match(1).unwrap_or_default();
            res.write_ok(format!("{{\"id\":{id}}}\n"), &Headers::new().with("Content-Type", "application/json"));
        })?
        .post("/echo", |req: &mut Request, res: &mut Response| {
            let body = req.content().bytes();
            res.write_ok(body, &Headers::new());
        })?
        .get("/shutdown", |_: &mut Request, res: &mut Response| {
            res.set_close_connection_after_response(true);
            res.write_ok("bye\n", &Headers::new().with("Content-Length", "4"));
        })?;
    router.default_handler("GET", |req: &mut Request, res: &mut Response| {
        res.write(StatusCode::NotFound, format!("no route for {}\n", req.path()), &Headers::new());
    });

    let server = Arc::new(
        HttpServer::new(Config::new(8080).address("127.0.0.1").workers(4), router).on_error(|req, err| {
            tracing::warn!(path = ?req.map(|r| r.path()), kind = ?err.kind(), "{err}");
        }),
    );
    let port = server.bind()?;
    tracing::info!("listening on http://127.0.0.1:{port}");

    // Stop on a line from stdin so the runtime winds down cleanly.
    let stopper = Arc::clone(&server);
    thread::spawn(move || {
        let mut line = String::new();
        let _ = std::io::stdin().read_line(&mut line);
        stopper.stop();
    });

    server.accept_and_run()?;
    Ok(())
}
