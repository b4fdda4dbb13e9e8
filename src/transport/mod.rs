pub mod memory;
pub mod traits;
pub mod udp;

pub use traits::{CommandLink, DatagramSource};
pub use udp::{UdpCommandLink, UdpDatagramSource};

/// The three channels a controller runs over.
#[derive(Debug)]
pub struct Links<C, S, V> {
    pub command: C,
    pub status: S,
    pub video: V,
}
