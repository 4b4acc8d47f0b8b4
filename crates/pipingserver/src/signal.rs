// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Shutdown signal detection

use tokio::signal::ctrl_c;

/// Future that resolves when a graceful shutdown has been requested.
///
/// Detects a `SIGINT`.
///
/// **BEWARE:** This alters process state by _permanently_ registering an
/// interrupt handler through [`tokio`], so it should only be called near the
/// entry point of a program. The usual caveats around signals apply; they may
/// only be detected after this is first called, multiple signals may be
/// collapsed, etc.
pub async fn graceful_shutdown_requested() {
    ctrl_c().await.expect("Unable to await CTRL-C");
}

/// Future that resolves when a fast shutdown has been requested.
///
/// Things that constitute a request for a fast shutdown:
///
/// * Multiple `SIGINT`s
/// * At least one `SIGTERM`
///
/// **BEWARE:** Same process-state caveats as
/// [`graceful_shutdown_requested`].
pub async fn fast_shutdown_requested() {
    let want_to_shutdown = async {
        ctrl_c().await.expect("Unable to await CTRL-C");
        ctrl_c().await.expect("Unable to await CTRL-C");
    };

    #[cfg(unix)]
    let want_to_shutdown = async {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate()).expect("Can't register SIGTERM handler");
        tokio::select! {
            _ = want_to_shutdown => {},
            _ = sigterm.recv() => {},
        };
    };

    want_to_shutdown.await
}

// Signal handlers are global and permanent, which makes automated tests of
// this module more destructive than useful; it is exercised manually through
// the server binary.
