// This file is part of Vigil VRS, a multi-camera video recording supervisor.
// Copyright (C) 2024 The Vigil VRS Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Small read-only HTTP dashboard plus command forwarding.
//!
//! Everything served here comes from the in-process status registry and the
//! cameras' snapshot files; recording state changes go through the same
//! enable flags the bus uses.

use std::sync::Arc;

use base::signal::Receiver;
use base::{err, Error, ErrorKind};
use bytes::Bytes;
use http::{header, Method, Request, Response, StatusCode};
use http_body_util::Full;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::config::HttpConfig;
use crate::supervisor::{status_snapshot, Registry};

type Body = Full<Bytes>;

#[derive(Debug, Eq, PartialEq)]
enum Route<'a> {
    Cameras,
    Snapshot(&'a str),
    Start(&'a str),
    Stop(&'a str),
    NotFound,
}

fn route<'a>(method: &Method, path: &'a str) -> Route<'a> {
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    match (method, segments.as_slice()) {
        (&Method::GET, ["api", "cameras"]) => Route::Cameras,
        (&Method::GET, ["api", "cameras", name, "snapshot.jpg"]) => Route::Snapshot(name),
        (&Method::POST, ["api", "cameras", name, "start"]) => Route::Start(name),
        (&Method::POST, ["api", "cameras", name, "stop"]) => Route::Stop(name),
        _ => Route::NotFound,
    }
}

pub struct Service {
    registry: Registry,
}

impl Service {
    pub fn new(registry: Registry) -> Self {
        Service { registry }
    }

    pub async fn serve(
        self: Arc<Self>,
        req: Request<hyper::body::Incoming>,
    ) -> Result<Response<Body>, std::convert::Infallible> {
        let resp = match self.serve_inner(&req).await {
            Ok(resp) => resp,
            Err(e) => {
                let status = match e.kind() {
                    ErrorKind::NotFound => StatusCode::NOT_FOUND,
                    ErrorKind::InvalidArgument => StatusCode::BAD_REQUEST,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                plain(status, format!("{}\n", e))
            }
        };
        Ok(resp)
    }

    async fn serve_inner(&self, req: &Request<hyper::body::Incoming>) -> Result<Response<Body>, Error> {
        match route(req.method(), req.uri().path()) {
            Route::Cameras => {
                let statuses: Vec<crate::json::Status> = self
                    .registry
                    .values()
                    .map(|cam| status_snapshot(cam, false))
                    .collect();
                json(&statuses)
            }
            Route::Snapshot(name) => {
                let cam = self.camera(name)?;
                let path = cam.cfg.snapshot_path()?;
                let bytes = tokio::fs::read(&path)
                    .await
                    .map_err(|e| err!(NotFound, msg("no snapshot for {name}"), source(e)))?;
                Ok(Response::builder()
                    .header(header::CONTENT_TYPE, "image/jpeg")
                    .body(Full::new(Bytes::from(bytes)))
                    .expect("static response"))
            }
            Route::Start(name) => {
                self.camera(name)?.record.set();
                json(&serde_json::json!({"ok": true}))
            }
            Route::Stop(name) => {
                self.camera(name)?.record.clear();
                json(&serde_json::json!({"ok": true}))
            }
            Route::NotFound => Err(err!(NotFound, msg("no such resource"))),
        }
    }

    fn camera(&self, name: &str) -> Result<&Arc<crate::supervisor::Camera>, Error> {
        self.registry
            .get(name)
            .ok_or_else(|| err!(NotFound, msg("no camera {name:?}")))
    }
}

fn json<T: serde::Serialize>(v: &T) -> Result<Response<Body>, Error> {
    let raw = serde_json::to_vec(v).map_err(|e| err!(Internal, msg("encode json"), source(e)))?;
    Ok(Response::builder()
        .header(header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(raw)))
        .expect("static response"))
}

fn plain(status: StatusCode, text: String) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain")
        .body(Full::new(Bytes::from(text)))
        .expect("static response")
}

/// Accept loop; connections drain gracefully on shutdown.
pub async fn serve(
    http: &HttpConfig,
    registry: Registry,
    mut shutdown: Receiver,
) -> Result<(), Error> {
    let addr = format!("{}:{}", http.host, http.port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| err!(Unavailable, msg("unable to bind to {addr}"), source(e)))?;
    info!(%addr, "dashboard listening");
    let svc = Arc::new(Service::new(registry));
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            accepted = listener.accept() => {
                let (stream, _peer) = match accepted {
                    Ok(a) => a,
                    Err(e) => {
                        warn!(err = %e, "accept failed");
                        continue;
                    }
                };
                let svc = svc.clone();
                let mut conn_shutdown = shutdown.clone();
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let conn = hyper::server::conn::http1::Builder::new().serve_connection(
                        io,
                        hyper::service::service_fn(move |req| {
                            let svc = svc.clone();
                            svc.serve(req)
                        }),
                    );
                    tokio::pin!(conn);
                    tokio::select! {
                        r = &mut conn => {
                            if let Err(e) = r {
                                debug!(err = %e, "connection error");
                            }
                        }
                        _ = conn_shutdown.recv() => {
                            conn.as_mut().graceful_shutdown();
                            let _ = conn.await;
                        }
                    }
                });
            }
        }
    }
    info!("dashboard shut down");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing() {
        assert_eq!(route(&Method::GET, "/api/cameras"), Route::Cameras);
        assert_eq!(
            route(&Method::GET, "/api/cameras/cam0/snapshot.jpg"),
            Route::Snapshot("cam0")
        );
        assert_eq!(route(&Method::POST, "/api/cameras/cam0/start"), Route::Start("cam0"));
        assert_eq!(route(&Method::POST, "/api/cameras/cam0/stop"), Route::Stop("cam0"));
        assert_eq!(route(&Method::GET, "/api/cameras/cam0/start"), Route::NotFound);
        assert_eq!(route(&Method::GET, "/"), Route::NotFound);
    }
}
