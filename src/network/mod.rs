//! Frame decoding and packet representation

pub mod packet;
pub mod testing;

pub use packet::{CapturedPacket, LayerType, TcpMeta, TransportMeta};
