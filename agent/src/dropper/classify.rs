//! The per-connection drop decision: pure, synchronous, deterministic.

use pnet::packet::{
    ipv4::Ipv4Packet,
    tcp::TcpPacket,
    Packet,
};

use crate::error::{AgentError, AgentResult};

/// `(crc mod 100) < 100 * drop_rate`, over the CRC-32 (IEEE) of a
/// 36-byte 4-tuple: 16-byte source IP, 16-byte destination IP, 2-byte
/// source port, 2-byte destination port (both little-endian), IPv4
/// addresses left-padded into the 16-byte slots. Same 4-tuple always
/// yields the same verdict, so a connection is either wholly dropped or
/// wholly kept for its lifetime.
#[derive(Debug, Clone, Copy)]
pub struct Dropper {
    drop_rate: f64,
}

impl Dropper {
    pub fn new(drop_rate: f64) -> AgentResult<Self> {
        if !(0.0..=1.0).contains(&drop_rate) {
            return Err(AgentError::Validation(format!("drop_rate must be in [0, 1], got {drop_rate}")));
        }
        Ok(Self { drop_rate })
    }

    /// `true` if the packet's connection should be dropped. Packets that
    /// don't parse as IPv4+TCP are always accepted.
    pub fn should_drop(&self, ipv4_packet: &[u8]) -> bool {
        match four_tuple(ipv4_packet) {
            Some(tuple) => {
                let crc = crc32fast::hash(&tuple);
                f64::from(crc % 100) < 100.0 * self.drop_rate
            }
            None => false,
        }
    }
}

/// The 36-byte tuple: src/dst IP in 16-byte (IPv4-mapped) slots, then
/// src/dst port as little-endian `u16`s.
fn four_tuple(ipv4_packet: &[u8]) -> Option<[u8; 36]> {
    let ipv4 = Ipv4Packet::new(ipv4_packet)?;
    let tcp = TcpPacket::new(ipv4.payload())?;

    let mut tuple = [0u8; 36];
    tuple[0..16][12..16].copy_from_slice(&ipv4.get_source().octets());
    tuple[16..32][12..16].copy_from_slice(&ipv4.get_destination().octets());
    tuple[32..34].copy_from_slice(&tcp.get_source().to_le_bytes());
    tuple[34..36].copy_from_slice(&tcp.get_destination().to_le_bytes());
    Some(tuple)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pnet::packet::ip::IpNextHeaderProtocols;
    use pnet::packet::ipv4::{self, MutableIpv4Packet};
    use pnet::packet::tcp::MutableTcpPacket;

    fn build_packet(src_ip: [u8; 4], dst_ip: [u8; 4], src_port: u16, dst_port: u16) -> Vec<u8> {
        const TCP_HEADER_LEN: usize = 20;
        const IP_HEADER_LEN: usize = 20;

        let mut tcp_buffer = vec![0u8; TCP_HEADER_LEN];
        let mut tcp = MutableTcpPacket::new(&mut tcp_buffer).unwrap();
        tcp.set_source(src_port);
        tcp.set_destination(dst_port);
        tcp.set_data_offset(5);

        let mut buffer = vec![0u8; IP_HEADER_LEN + TCP_HEADER_LEN];
        let mut packet = MutableIpv4Packet::new(&mut buffer).unwrap();
        packet.set_version(4);
        packet.set_header_length(5);
        packet.set_total_length((IP_HEADER_LEN + TCP_HEADER_LEN) as u16);
        packet.set_ttl(64);
        packet.set_next_level_protocol(IpNextHeaderProtocols::Tcp);
        packet.set_source(src_ip.into());
        packet.set_destination(dst_ip.into());
        packet.set_payload(&tcp_buffer);
        let checksum = ipv4::checksum(&packet.to_immutable());
        packet.set_checksum(checksum);

        buffer
    }

    #[test]
    fn rejects_invalid_drop_rate() {
        assert!(Dropper::new(-0.1).is_err());
        assert!(Dropper::new(1.1).is_err());
    }

    #[test]
    fn non_ipv4_tcp_packets_are_always_accepted() {
        let dropper = Dropper::new(1.0).unwrap();
        assert!(!dropper.should_drop(&[0u8; 4]));
    }

    #[test]
    fn zero_rate_never_drops_and_full_rate_always_drops() {
        let packet = build_packet([10, 0, 0, 1], [10, 0, 0, 2], 51000, 443);

        let never = Dropper::new(0.0).unwrap();
        assert!(!never.should_drop(&packet));

        let always = Dropper::new(1.0).unwrap();
        assert!(always.should_drop(&packet));
    }

    #[test]
    fn same_four_tuple_always_yields_the_same_verdict() {
        let dropper = Dropper::new(0.5).unwrap();
        let packet_a = build_packet([10, 0, 0, 1], [10, 0, 0, 2], 51000, 443);
        let packet_b = build_packet([10, 0, 0, 1], [10, 0, 0, 2], 51000, 443);
        assert_eq!(dropper.should_drop(&packet_a), dropper.should_drop(&packet_b));
    }

    #[test]
    fn drop_rate_converges_within_tolerance_over_many_connections() {
        let drop_rate = 0.3;
        let dropper = Dropper::new(drop_rate).unwrap();
        let samples = 2000;
        let dropped = (0..samples)
            .map(|i| {
                let src_port = 20000 + (i % 40000) as u16;
                build_packet([10, 0, 0, 1], [10, 0, 0, 2], src_port, 443)
            })
            .filter(|packet| dropper.should_drop(packet))
            .count();

        let observed_rate = dropped as f64 / samples as f64;
        assert!(
            (observed_rate - drop_rate).abs() < 0.05,
            "observed {observed_rate}, expected close to {drop_rate}"
        );
    }
}
