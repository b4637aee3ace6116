//! The privileged split-tunnel daemon.
//!
//! Owns the TUN device and every system-level collaborator, wires them into
//! the gateway core, and supervises shutdown. Startup order matters: packet
//! filter first, then the DNS block, then (when requested) the kill switch,
//! and only then the capture routes.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

#[cfg(target_os = "linux")]
mod run;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log filter directives, e.g. `info` or `weir_gateway=debug,info`.
    #[arg(long, env = "WEIR_LOG", default_value = "info")]
    log: String,

    /// Name of the TUN interface we create and own.
    #[arg(long, default_value = "weir0")]
    tun: String,

    /// Address assigned to the TUN interface.
    #[arg(long, default_value = "10.64.0.1")]
    tun_address: std::net::Ipv4Addr,

    #[arg(long, default_value_t = 1400)]
    tun_mtu: u32,

    /// Configuration document handed over by the control plane.
    /// Re-read on SIGHUP.
    #[arg(long)]
    config: PathBuf,

    /// Category tables for `geosite:` domain rules (JSON map of name to
    /// domain list).
    #[arg(long)]
    categories: Option<PathBuf>,

    /// Permit egress only through the TUN, the configured VPN endpoints and
    /// loopback.
    #[arg(long)]
    kill_switch: bool,

    /// Back tunnels with an in-memory loopback transport instead of a real
    /// VPN engine. For local smoke runs only.
    #[arg(long, hide = true)]
    loopback_transport: bool,
}

#[cfg(target_os = "linux")]
#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let reload_handle = logging::setup(&cli.log)?;

    run::run(cli, reload_handle).await
}

#[cfg(not(target_os = "linux"))]
fn main() -> Result<()> {
    anyhow::bail!("weir-daemon currently supports Linux only");
}
