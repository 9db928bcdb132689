//! Thin binary wiring `disruptor_agent`'s collaborators together per the
//! command-line contract. All interesting behavior lives in the library
//! crate; this binary only parses flags, builds collaborators, and maps
//! errors to a process exit code.

mod args;

use std::sync::Arc;

use clap::Parser;
use disruptor_agent::{
    AgentError, AgentResult, AgentRunner, GrpcDisruption, GrpcProxy, GrpcProxyConfig, HttpDisruption, HttpProxy,
    HttpProxyConfig, NetworkDropDisruptor, NfQueue, ProfilingConfig, ProtocolDisruptor, Queue, RedirectionSpec,
    TcpDropDisruptor, ThreadRng, TrafficInterceptor,
};
use disruptor_netfilter::{ShellAddr, ShellIpTables};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use args::{Cli, Command, GrpcArgs, HttpArgs, NetworkDropArgs, ProfilingArgs, TcpDropArgs};

fn profiling_config(args: ProfilingArgs) -> ProfilingConfig {
    ProfilingConfig {
        cpu_path: args.profile_cpu,
        memory_path: args.profile_memory,
        trace_path: args.profile_trace,
    }
}

fn interceptor_spec(
    transparent: bool,
    interface: Option<String>,
    address: Option<std::net::Ipv4Addr>,
    proxy_port: u16,
    target_port: u16,
) -> AgentResult<Option<RedirectionSpec>> {
    if !transparent {
        return Ok(None);
    }

    let interface = interface.ok_or_else(|| {
        AgentError::Validation("--transparent requires --transparent-interface".to_string())
    })?;
    let local_address = address.ok_or_else(|| {
        AgentError::Validation("--transparent requires --transparent-address".to_string())
    })?;

    Ok(Some(RedirectionSpec {
        interface,
        local_address,
        proxy_port,
        target_port,
    }))
}

async fn run_http(args: HttpArgs, profiling: ProfilingConfig) -> AgentResult<()> {
    let disruption = HttpDisruption {
        average_delay: args.average_delay,
        delay_variation: args.delay_variation,
        error_rate: args.error_rate,
        error_code: args.error_code,
        error_body: args.error_body.into_bytes(),
        excluded_paths: args.excluded_paths,
    };

    let spec = interceptor_spec(
        args.transparent,
        args.transparent_interface,
        args.transparent_address,
        args.listen.port(),
        args.target.port(),
    )?;

    let rng = Arc::new(ThreadRng);
    let proxy = Arc::new(HttpProxy::new(
        HttpProxyConfig {
            listen_address: args.listen,
            upstream_address: args.target,
            local_address: args.transparent_address.map(std::net::IpAddr::V4),
            disruption,
        },
        rng,
    )?);

    let interceptor = spec
        .map(|spec| TrafficInterceptor::new(spec, Arc::new(ShellIpTables::ipv4()), ShellAddr::default()))
        .transpose()?;

    let disruptor = ProtocolDisruptor::<HttpProxy, ShellIpTables, ShellAddr>::new(proxy, interceptor);
    let lock = disruptor_agent::FileLock::for_binary("xk6-disruptor-agent");
    AgentRunner::new(lock, profiling, disruptor)
        .run(CancellationToken::new(), args.duration)
        .await
}

async fn run_grpc(args: GrpcArgs, profiling: ProfilingConfig) -> AgentResult<()> {
    let disruption = GrpcDisruption {
        average_delay: args.average_delay,
        delay_variation: args.delay_variation,
        error_rate: args.error_rate,
        status_code: args.status_code,
        status_message: args.status_message,
        excluded_services: args.excluded_services,
    };

    let spec = interceptor_spec(
        args.transparent,
        args.transparent_interface,
        args.transparent_address,
        args.listen.port(),
        args.target.port(),
    )?;

    let rng = Arc::new(ThreadRng);
    let proxy = Arc::new(GrpcProxy::new(
        GrpcProxyConfig {
            listen_address: args.listen,
            upstream_address: args.target,
            local_address: args.transparent_address.map(std::net::IpAddr::V4),
            disruption,
        },
        rng,
    )?);

    let interceptor = spec
        .map(|spec| TrafficInterceptor::new(spec, Arc::new(ShellIpTables::ipv4()), ShellAddr::default()))
        .transpose()?;

    let disruptor = ProtocolDisruptor::<GrpcProxy, ShellIpTables, ShellAddr>::new(proxy, interceptor);
    let lock = disruptor_agent::FileLock::for_binary("xk6-disruptor-agent");
    AgentRunner::new(lock, profiling, disruptor)
        .run(CancellationToken::new(), args.duration)
        .await
}

async fn run_tcp_drop(args: TcpDropArgs, profiling: ProfilingConfig) -> AgentResult<()> {
    let rng = ThreadRng;
    let queue = Queue::new(args.port, args.drop_rate, Arc::new(ShellIpTables::ipv4()), &rng, NfQueue::bind)?;
    let disruptor = TcpDropDisruptor::new(queue);
    let lock = disruptor_agent::FileLock::for_binary("xk6-disruptor-agent");
    AgentRunner::new(lock, profiling, disruptor)
        .run(CancellationToken::new(), args.duration)
        .await
}

async fn run_network_drop(args: NetworkDropArgs, profiling: ProfilingConfig) -> AgentResult<()> {
    let disruptor = NetworkDropDisruptor::new(Arc::new(ShellIpTables::ipv4()), args.port, &args.protocol);
    let lock = disruptor_agent::FileLock::for_binary("xk6-disruptor-agent");
    AgentRunner::new(lock, profiling, disruptor)
        .run(CancellationToken::new(), args.duration)
        .await
}

fn run_cleanup() -> AgentResult<()> {
    let lock = disruptor_agent::FileLock::for_binary("xk6-disruptor-agent");
    match lock.owner_pid()? {
        Some(pid) => {
            nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), nix::sys::signal::Signal::SIGTERM)
                .map_err(|error| AgentError::Runtime(format!("signalling pid {pid}: {error}")))?;
            tracing::info!(pid, "sent SIGTERM to the locked agent");
            Ok(())
        }
        None => {
            tracing::info!("no agent is currently locked");
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();

    let profiling = profiling_config(cli.profiling);

    let result = match cli.command {
        Command::Http(args) => run_http(args, profiling).await,
        Command::Grpc(args) => run_grpc(args, profiling).await,
        Command::TcpDrop(args) => run_tcp_drop(args, profiling).await,
        Command::NetworkDrop(args) => run_network_drop(args, profiling).await,
        Command::Cleanup => run_cleanup(),
    };

    if let Err(error) = result {
        eprintln!("{error}");
        std::process::exit(1);
    }
}
