//! oxidav server binary.
//!
//! This crate implements a WebDAV (RFC 4918) class 1+2 server: a method
//! dispatcher with lock checking and precondition evaluation, an
//! exclusive write lock manager, an `If` header condition evaluator, and
//! a multistatus XML layer, over a pluggable filesystem contract backed
//! here by an in-memory tree. The main entry point builds the Axum
//! router and starts the HTTP listener.

mod cond;
mod config;
mod dav;
mod davpath;
mod error;
mod etag;
mod fs;
mod http;
mod lock;
mod logging;
mod memfs;
mod xml;

use axum::extract::{Extension, connect_info::ConnectInfo};
use axum::http::Request;
use axum::routing::any;
use axum::Router;
use axum_server::Handle;
use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info, info_span};

use crate::config::Args;
use crate::dav::DavHandler;
use crate::memfs::MemFs;

/// Starts the oxidav server and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    let args = Args::parse();
    logging::init_logging(args.debug);

    let dav_handler = Arc::new(DavHandler::new(Arc::new(MemFs::new()), args.debug));

    let app = Router::new()
        .route("/", any(dav::webdav_handler))
        .route("/{*path}", any(dav::webdav_handler))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    let forwarded_ip = request
                        .headers()
                        .get("x-forwarded-for")
                        .and_then(|v| v.to_str().ok())
                        .map(|s| s.split(',').next().unwrap_or("").trim().to_string());
                    let connect_ip = request
                        .extensions()
                        .get::<ConnectInfo<SocketAddr>>()
                        .map(|ConnectInfo(addr)| addr.to_string());
                    let client_ip = forwarded_ip
                        .or(connect_ip)
                        .unwrap_or_else(|| "unknown".to_string());

                    info_span!(
                        env!("CARGO_CRATE_NAME"),
                        client_ip,
                        method = ?request.method(),
                        path = ?request.uri().path(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .layer(Extension(dav_handler));

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()))?;
    let addr = SocketAddr::new(host, args.http_port);
    let handle = Handle::new();

    info!("Starting HTTP server at {}", addr);
    let server = axum_server::bind(addr)
        .handle(handle.clone())
        .serve(app.into_make_service_with_connect_info::<SocketAddr>());

    tokio::select! {
        result = server => result?,
        _ = shutdown_signal(handle) => {}
    }

    Ok(())
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received termination signal shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(10)));
}
