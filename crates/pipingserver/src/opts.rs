// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::net::IpAddr;

use clap::{crate_version, Parser};

#[derive(Debug, Parser)]
#[clap(
    name = "pipingserver",
    about = "HTTP data rendezvous relay",
    version = crate_version!()
)]
pub struct Opts {
    #[clap(
        long,
        help = "Address to listen on.",
        default_value = "0.0.0.0",
        env = "PIPINGSERVER_HOST"
    )]
    pub host: IpAddr,

    #[clap(
        short,
        long,
        help = "Port to listen on.",
        default_value = "8080",
        env = "PIPINGSERVER_PORT"
    )]
    pub port: u16,

    #[clap(
        long,
        help = "Maximum simultaneously connected clients before connections are no longer accepted",
        default_value = "1024",
        env = "PIPINGSERVER_MAX_CLIENTS"
    )]
    pub max_clients: usize,
}
