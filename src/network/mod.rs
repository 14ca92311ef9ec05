//! Peer-to-peer networking
//!
//! Framed packets over short-lived TCP connections, the peer registry, and
//! the PeerSync state machine that exchanges heights, inventories, blocks
//! and transactions between nodes.

pub mod node;
pub mod packet;
pub mod server;
pub mod sync;
pub mod transport;

pub use node::Nodes;
pub use packet::{read_packet, write_packet, Command, Message, OpType, Packet, PROTOCOL_VERSION};
pub use server::{send_tx, Server};
pub use sync::{PeerSync, SYNC_MARGIN};
pub use transport::{TcpTransport, Transport};
