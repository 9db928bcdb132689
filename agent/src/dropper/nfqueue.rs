//! Binds the real Linux NFQUEUE kernel API via the `nfq` crate. The socket
//! is switched to non-blocking mode right after bind so polling it from
//! [`super::queue::Queue`]'s async loop never parks a tokio worker thread
//! on a syscall that would otherwise block until the next packet arrives.

use std::collections::HashMap;
use std::os::unix::io::AsRawFd;

use nfq::{Message, Queue as RawQueue, Verdict};
use nix::fcntl::{fcntl, FcntlArg, OFlag};

use crate::error::{AgentError, AgentResult};

use super::queue::{PacketQueue, QueuedPacket};

/// A `PacketQueue` backed by a real `NFQUEUE` handle bound to `queue_num` —
/// the same number installed in the companion `--queue-num` iptables rule.
/// Messages awaiting a verdict are held by packet id until `accept`/
/// `requeue_with_mark` is called.
pub struct NfQueue {
    queue: RawQueue,
    pending: HashMap<u32, Message>,
}

impl NfQueue {
    pub fn bind(queue_num: u16) -> AgentResult<Self> {
        let mut queue =
            RawQueue::open().map_err(|error| AgentError::Setup(format!("opening nfqueue socket: {error}")))?;
        queue
            .bind(queue_num)
            .map_err(|error| AgentError::Setup(format!("binding nfqueue {queue_num}: {error}")))?;

        let fd = queue.as_raw_fd();
        let current = fcntl(fd, FcntlArg::F_GETFL)
            .map_err(|error| AgentError::Setup(format!("reading nfqueue socket flags: {error}")))?;
        let nonblocking = OFlag::from_bits_truncate(current) | OFlag::O_NONBLOCK;
        fcntl(fd, FcntlArg::F_SETFL(nonblocking))
            .map_err(|error| AgentError::Setup(format!("setting nfqueue socket non-blocking: {error}")))?;

        Ok(Self {
            queue,
            pending: HashMap::new(),
        })
    }

    fn take_pending(&mut self, id: u32) -> AgentResult<Message> {
        self.pending
            .remove(&id)
            .ok_or_else(|| AgentError::Runtime(format!("no pending nfqueue message for packet {id}")))
    }
}

impl PacketQueue for NfQueue {
    fn try_recv(&mut self) -> AgentResult<Option<QueuedPacket>> {
        match self.queue.recv() {
            Ok(message) => {
                let id = message.get_packet_id();
                let payload = message.get_payload().to_vec();
                self.pending.insert(id, message);
                Ok(Some(QueuedPacket { id, payload }))
            }
            Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(error) => Err(AgentError::Runtime(format!("reading nfqueue packet: {error}"))),
        }
    }

    fn accept(&mut self, id: u32) -> AgentResult<()> {
        let mut message = self.take_pending(id)?;
        message.set_verdict(Verdict::Accept);
        self.queue
            .verdict(message)
            .map_err(|error| AgentError::Runtime(format!("accepting nfqueue packet {id}: {error}")))
    }

    fn requeue_with_mark(&mut self, id: u32, mark: u32) -> AgentResult<()> {
        let mut message = self.take_pending(id)?;
        message.set_mark(mark);
        message.set_verdict(Verdict::Repeat);
        self.queue
            .verdict(message)
            .map_err(|error| AgentError::Runtime(format!("requeueing nfqueue packet {id}: {error}")))
    }
}
