//! L4 proxy assembly: the userspace TCP stack and the UDP flow forwarders.

pub mod tcp;
pub mod udp;
