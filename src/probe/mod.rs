pub mod builder;
pub mod checksum;
pub mod correlate;
pub mod icmp;
pub mod ip;
pub mod socket;
pub mod tcp;
pub mod udp;

pub use builder::{OutboundProbe, ProbeBuilder};
pub use correlate::{ParsedReply, ReplyFilter, parse_icmp_reply, parse_tcp_reply};
pub use socket::{InboundPacket, NullTransport, RawTransport, ReplyChannel, Transport};
pub use tcp::local_addr_for;
pub use udp::{decode_port, encode_port, port_capacity};
