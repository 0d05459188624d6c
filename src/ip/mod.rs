pub mod defs;
pub mod icmp;
pub mod packet;
pub mod reassembly;
pub mod send;

pub use defs::{IpErr, Ipv4RxInfo, Ipv4Type};
pub use packet::{ChksumAccumulator, Ipv4Header, IPV4_HEADER_LEN};
pub use reassembly::{Ipv4Reassembly, ReassConfig};
pub use send::{IpSendParams, IpSender, RetryToken};
