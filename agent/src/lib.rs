//! Core fault-injection data plane: transparent interception, the HTTP
//! and gRPC proxies, the connection dropper, and the agent's lifecycle.

pub mod disruption;
pub mod disruptor;
pub mod dropper;
pub mod error;
pub mod grpc;
pub mod http;
pub mod interceptor;
pub mod lock;
pub mod metrics;
pub mod profiling;
pub mod rng;
pub mod runner;
pub mod signal;

pub use disruption::{GrpcDisruption, HttpDisruption};
pub use disruptor::{Disruptor, NetworkDropDisruptor, ProtocolDisruptor, Proxy, TcpDropDisruptor};
pub use dropper::{Dropper, NfQueue, PacketQueue, Queue, QueuedPacket};
pub use error::{AgentError, AgentResult};
pub use grpc::{GrpcProxy, GrpcProxyConfig};
pub use http::{HttpProxy, HttpProxyConfig};
pub use interceptor::{RedirectionSpec, TrafficInterceptor};
pub use lock::{FileLock, Lock};
pub use metrics::MetricMap;
pub use profiling::ProfilingHandles;
pub use rng::{Rng, SeededRng, ThreadRng};
pub use runner::{AgentRunner, ProfilingConfig};
pub use signal::{Signal, Signals};
