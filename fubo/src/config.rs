// Copyright (c) 2022 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use clap::Parser;
use std::path::PathBuf;

/// Command line surface of the broker binary.
///
/// The TLS and websocket listeners are wired by the embedding host; the
/// options are accepted here so wrapper scripts keep working, and the
/// server warns when they are given.
#[derive(Debug, Clone, Parser)]
#[command(name = "fubo", version, about = "MQTT 3.1.1 / 5.0 broker")]
pub struct CommandLine {
    /// Port of the plain tcp listener.
    #[arg(long = "tcp.port", default_value_t = 1883)]
    pub tcp_port: u16,

    /// Port of the websocket listener.
    #[arg(long = "ws.port")]
    pub ws_port: Option<u16>,

    /// Port of the tls listener.
    #[arg(long = "tls.port")]
    pub tls_port: Option<u16>,

    /// Port of the websocket-over-tls listener.
    #[arg(long = "wss.port")]
    pub wss_port: Option<u16>,

    /// Server certificate file for the tls listeners.
    #[arg(long)]
    pub certificate: Option<PathBuf>,

    /// Server private key file for the tls listeners.
    #[arg(long = "private_key")]
    pub private_key: Option<PathBuf>,

    /// CA file used to verify client certificates.
    #[arg(long = "verify_file")]
    pub verify_file: Option<PathBuf>,

    /// Certificate field carrying the username, e.g. `CN`.
    #[arg(long = "verify_field", default_value = "CN")]
    pub verify_field: String,

    /// Authentication / authorization json file. Without it every client
    /// is let in anonymously with full access.
    #[arg(long = "auth_file")]
    pub auth_file: Option<PathBuf>,

    /// Number of I/O contexts to run.
    #[arg(long, default_value_t = 1)]
    pub iocs: usize,

    /// Worker threads per I/O context.
    #[arg(long = "threads_per_ioc", default_value_t = 1)]
    pub threads_per_ioc: usize,

    /// Pin worker threads to cores.
    #[arg(long = "fixed_core_map")]
    pub fixed_core_map: bool,

    /// Log verbosity, 0 (quiet) to 5 (trace).
    #[arg(long, default_value_t = 2)]
    pub verbose: u8,

    /// Optional log file; console only when absent.
    #[arg(long = "log_file")]
    pub log_file: Option<PathBuf>,
}

impl CommandLine {
    /// Total worker threads backing the runtime.
    #[must_use]
    pub fn worker_threads(&self) -> usize {
        (self.iocs.max(1)) * (self.threads_per_ioc.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cmdline = CommandLine::parse_from(["fubo"]);
        assert_eq!(cmdline.tcp_port, 1883);
        assert_eq!(cmdline.verbose, 2);
        assert_eq!(cmdline.worker_threads(), 1);
    }

    #[test]
    fn test_dotted_options() {
        let cmdline = CommandLine::parse_from([
            "fubo",
            "--tcp.port",
            "11883",
            "--iocs",
            "2",
            "--threads_per_ioc",
            "4",
        ]);
        assert_eq!(cmdline.tcp_port, 11_883);
        assert_eq!(cmdline.worker_threads(), 8);
    }
}
