// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! HTTP serving surface
//!
//! Accepts connections from any stream of connection-like objects (TCP in
//! production, in-memory pipes in tests) and serves each one with hyper,
//! dispatching every request to the relay router.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use futures::{FutureExt, Stream, StreamExt};
use hyper::body::{Body, Incoming};
use hyper::server::conn::http1;
use hyper::service::{service_fn, HttpService};
use hyper::Request;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::select;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{error, info, info_span, warn, Instrument};

use crate::opts::Opts;
use crate::registry::Registry;
use crate::router;
use crate::signal;

/// Serves HTTP connections while allowing for graceful shutdowns.
pub struct Server {
    connection_permits: Arc<Semaphore>,
    shutdown: watch::Sender<bool>,
}

impl Server {
    /// Create a new [`Server`].
    ///
    /// `max_connections` is the number of simultaneous connections that may
    /// be handled before new ones are turned away with a minimal 503.
    pub fn new(max_connections: usize) -> Self {
        let connection_permits = Arc::new(Semaphore::new(max_connections));
        let (shutdown, _) = watch::channel(false);
        Self {
            connection_permits,
            shutdown,
        }
    }

    /// Serve incoming `connections`, relaying through `registry`.
    ///
    /// Each connection is handled in its own task. Resolves after
    /// [`graceful_shutdown`](Self::graceful_shutdown) has been called (or
    /// `connections` is exhausted) and every ongoing connection has ended.
    pub async fn serve<P, C>(&self, connections: P, registry: Registry)
    where
        P: Stream<Item = std::io::Result<(C, SocketAddr)>>,
        C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mut shutdown_receiver = self.shutdown.subscribe();
        let mut was_shutdown = pin!(shutdown_receiver.wait_for(|&done| done).map(|_| None));
        let mut tasks = JoinSet::new();

        info!("Started serving");

        // Scope forces `connections` to be dropped before waiting on the
        // remaining connection tasks.
        {
            let mut connections = pin!(connections);
            loop {
                let accepted = select! {
                    // Biased so no new connection is handled once shutdown
                    // has been observed.
                    biased;
                    stop = &mut was_shutdown => stop,
                    next = connections.next() => next,
                };
                let Some(accepted) = accepted else { break };

                let (connection, peer_addr) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        error!("Couldn't accept connection: {err}");
                        continue;
                    }
                };

                let span = info_span!("connection", addr = %peer_addr);
                match self.connection_permits.clone().try_acquire_owned() {
                    Ok(permit) => {
                        let registry = registry.clone();
                        let shutdown = self.shutdown.subscribe();
                        tasks.spawn(
                            handle_connection(connection, registry, permit, shutdown)
                                .instrument(span),
                        );
                    }
                    Err(_) => {
                        tasks.spawn(
                            async move {
                                warn!("Too many connections; sending minimal 503.");
                                let _ = decline_connection(connection).await;
                            }
                            .instrument(span),
                        );
                    }
                }
            }
        }

        while tasks.join_next().await.is_some() {}
        info!("Stopped serving");
    }

    /// Gracefully shuts down the server.
    ///
    /// Ongoing calls to [`serve`](Self::serve) stop accepting, ask every
    /// in-flight connection to finish its current exchange, and resolve once
    /// all of them have. Resolves when all current [`serve`](Self::serve)
    /// calls are resolved or aborted.
    pub async fn graceful_shutdown(&self) {
        self.shutdown.send_replace(true);
        self.shutdown.closed().await;
    }
}

async fn handle_connection<C>(
    connection: C,
    registry: Registry,
    permit: OwnedSemaphorePermit,
    mut shutdown: watch::Receiver<bool>,
) where
    C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    info!("Connected.");
    let _permit = permit;

    let service = service_fn(move |request: Request<Incoming>| {
        let registry = registry.clone();
        async move {
            info!("Request: {} {}", request.method(), request.uri());
            let response = router::route(&registry, request).await;
            info!("Response: {}", response.status());
            Ok::<_, Infallible>(response)
        }
    });

    // Half-close stays off: a peer that closes its connection while parked
    // in a rendezvous is cancelling that rendezvous, and the dropped handler
    // future is what cleans the slot up.
    let http_connection = http1::Builder::new()
        .half_close(false)
        .serve_connection(TokioIo::new(connection), service);
    let wants_shutdown = shutdown.wait_for(|&done| done);

    if let Err(err) = drive_connection(http_connection, wants_shutdown).await {
        warn!("Error serving connection: {err}");
    }
    info!("Disconnected.");
}

/// Poll `connection` to completion, asking it to shut down gracefully if
/// `want_shutdown` resolves first.
///
/// Polling a connection and shutting it down both need exclusive access, so
/// this drives them together in a manual `poll_fn`.
async fn drive_connection<I, S, B>(
    connection: http1::Connection<I, S>,
    want_shutdown: impl Future,
) -> Result<(), hyper::Error>
where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + 'static,
    S: HttpService<Incoming, ResBody = B>,
    S::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    B: Body + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let mut connection = pin!(connection);
    let mut want_shutdown = pin!(want_shutdown.fuse());
    std::future::poll_fn(|cx| {
        if want_shutdown.as_mut().poll(cx).is_ready() {
            connection.as_mut().graceful_shutdown();
        }
        connection.as_mut().poll(cx)
    })
    .await
}

/// Cheaply turn away an HTTP 1 connection with a minimal 503.
///
/// Skips the HTTP machinery entirely so an overloaded server spends as
/// little as possible on connections it cannot take.
async fn decline_connection(mut connection: impl AsyncWriteExt + Unpin) -> std::io::Result<()> {
    let write_response = async {
        let msg = b"HTTP/1.1 503 Service Unavailable\r\n\
                    Content-Type: text/plain;charset=utf-8\r\n\
                    Content-Length: 22\r\n\
                    \r\n\
                    Relay is at capacity.\n";
        connection.write_all(msg).await?;
        connection.shutdown().await
    };
    select! {
        result = write_response => result,
        _ = sleep(Duration::from_secs(1)) => Err(std::io::ErrorKind::TimedOut.into()),
    }
}

/// Bind and serve until a shutdown signal arrives.
pub async fn run(opts: Opts) -> anyhow::Result<()> {
    let registry = Registry::new();
    let server = Server::new(opts.max_clients);

    let address = SocketAddr::from((opts.host, opts.port));
    let listener = TcpListener::bind(address)
        .await
        .with_context(|| format!("binding {address}"))?;
    info!("Listening on {address}");
    let connections = futures::stream::unfold(listener, |listener| async {
        Some((listener.accept().await, listener))
    });

    let serve = server.serve(connections, registry);

    let graceful_shutdown = async {
        signal::graceful_shutdown_requested().await;
        info!("Graceful shutdown requested...");
        server.graceful_shutdown().await;
    };

    let serve_until_gracefully_shutdown = async { tokio::join!(serve, graceful_shutdown) };
    tokio::select! {
        biased;
        _ = signal::fast_shutdown_requested() => info!("Fast shutdown requested..."),
        _ = serve_until_gracefully_shutdown => {}
    };

    Ok(())
}
