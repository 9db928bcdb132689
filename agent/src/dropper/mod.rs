//! C4: the connection dropper, split into a pure classifier
//! ([`classify`]) and the kernel-queue plumbing ([`queue`]).

pub mod classify;
pub mod nfqueue;
pub mod queue;

pub use classify::Dropper;
pub use nfqueue::NfQueue;
pub use queue::{PacketQueue, Queue, QueuedPacket};
