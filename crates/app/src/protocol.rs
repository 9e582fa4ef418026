//! Wire protocol: the static command table and the byte codecs.
//!
//! Services ask the [`table::ProtocolTable`] for frames and decode
//! notifications with [`codec`]; neither touches the transport.

pub mod codec;
pub mod table;

pub use table::{Channel, CommandId, Frame, MI_BAND_3, ProtocolTable};
