//! Command-line surface: a root `xk6-disruptor-agent` command with one
//! subcommand per disruptor, plus persistent profiling flags. Fixes the
//! observable contract; all the interesting behavior lives in
//! `disruptor_agent`.

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use clap::{Args, Parser, Subcommand};

fn parse_duration(raw: &str) -> Result<Duration, String> {
    humantime::parse_duration(raw).map_err(|error| error.to_string())
}

#[derive(Debug, Parser)]
#[command(name = "xk6-disruptor-agent", version, about = "Injects network-level faults into traffic bound for a target application")]
pub struct Cli {
    /// Raise the default log level; repeatable. Ignored if `RUST_LOG` is set.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(flatten)]
    pub profiling: ProfilingArgs,

    #[command(subcommand)]
    pub command: Command,
}

/// Persistent profiling flags: CPU/memory/trace, each enabled by giving
/// it an output path.
#[derive(Debug, Args)]
pub struct ProfilingArgs {
    #[arg(long, global = true)]
    pub profile_cpu: Option<PathBuf>,
    #[arg(long, global = true)]
    pub profile_memory: Option<PathBuf>,
    #[arg(long, global = true)]
    pub profile_trace: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Runs the HTTP proxy, optionally behind the transparent interceptor.
    Http(HttpArgs),
    /// Runs the gRPC proxy, optionally behind the transparent interceptor.
    Grpc(GrpcArgs),
    /// Runs the connection dropper against a kernel packet queue.
    TcpDrop(TcpDropArgs),
    /// Installs a single blanket filter/INPUT DROP rule.
    NetworkDrop(NetworkDropArgs),
    /// Sends SIGTERM to the currently-locked agent, if any.
    Cleanup,
}

#[derive(Debug, Args)]
pub struct HttpArgs {
    #[arg(long, value_parser = parse_duration)]
    pub duration: Duration,

    #[arg(long, value_parser = parse_duration, default_value = "0s")]
    pub average_delay: Duration,

    #[arg(long, value_parser = parse_duration, default_value = "0s")]
    pub delay_variation: Duration,

    /// HTTP status code to synthesize when injecting an error.
    #[arg(long = "error", default_value_t = 0)]
    pub error_code: u16,

    #[arg(long = "rate", default_value_t = 0.0)]
    pub error_rate: f64,

    /// Byte-exact body for a synthesized error response.
    #[arg(long = "body", default_value = "")]
    pub error_body: String,

    /// Exact-match request paths excluded from disruption; repeatable.
    #[arg(long = "exclude")]
    pub excluded_paths: Vec<String>,

    #[arg(long)]
    pub transparent: bool,
    #[arg(long)]
    pub transparent_interface: Option<String>,
    #[arg(long)]
    pub transparent_address: Option<std::net::Ipv4Addr>,

    #[arg(long)]
    pub listen: SocketAddr,
    #[arg(long)]
    pub target: SocketAddr,
}

#[derive(Debug, Args)]
pub struct GrpcArgs {
    #[arg(long, value_parser = parse_duration)]
    pub duration: Duration,

    #[arg(long, value_parser = parse_duration, default_value = "0s")]
    pub average_delay: Duration,

    #[arg(long, value_parser = parse_duration, default_value = "0s")]
    pub delay_variation: Duration,

    /// gRPC status code to return when injecting an error.
    #[arg(long = "status", default_value_t = 0)]
    pub status_code: u32,

    #[arg(long = "message", default_value = "")]
    pub status_message: String,

    #[arg(long = "rate", default_value_t = 0.0)]
    pub error_rate: f64,

    /// Fully qualified service names excluded from disruption; repeatable.
    #[arg(long = "exclude")]
    pub excluded_services: Vec<String>,

    #[arg(long)]
    pub transparent: bool,
    #[arg(long)]
    pub transparent_interface: Option<String>,
    #[arg(long)]
    pub transparent_address: Option<std::net::Ipv4Addr>,

    #[arg(long)]
    pub listen: SocketAddr,
    #[arg(long)]
    pub target: SocketAddr,
}

#[derive(Debug, Args)]
pub struct TcpDropArgs {
    #[arg(long, value_parser = parse_duration)]
    pub duration: Duration,

    #[arg(long)]
    pub port: u16,

    #[arg(long = "rate", default_value_t = 0.0)]
    pub drop_rate: f64,
}

#[derive(Debug, Args)]
pub struct NetworkDropArgs {
    #[arg(long, value_parser = parse_duration)]
    pub duration: Duration,

    #[arg(long)]
    pub port: Option<u16>,

    #[arg(long, default_value = "tcp")]
    pub protocol: String,
}
