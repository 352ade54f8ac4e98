//! Wire protocol shared by the backhaul server and its clients
//!
//! Every connection to the tunnel port starts with one framed [`ClientMessage`]:
//! `Auth` opens a long-lived control connection, `RegProxy` offers a proxy
//! connection for an already-authenticated client.

mod codec;
mod messages;

pub use codec::{CodecError, TunnelCodec, MAX_FRAME_SIZE};
pub use messages::{ClientMessage, Protocol, ServerMessage};
