//! HTTP/2: frame codec, HPACK, flow control, the stream dependency
//! tree, and the server connection driver.

mod conn;
mod flow;
mod frame;
mod hpack;
mod stream;

pub use self::conn::{Http2Connection, Http2Factory, Http2Settings};
pub use self::flow::FlowWindow;
pub use self::frame::{FrameHead, FrameKind, Reason, Settings, StreamId};
pub use self::hpack::{Decoder as HpackDecoder, Encoder as HpackEncoder};
pub use self::stream::{StreamState, StreamTree};

/// The 24-byte client connection preface.
pub const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";
