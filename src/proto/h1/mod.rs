//! HTTP/1.x: incremental parser, head/body generator, and the
//! connection machine gluing them to a channel.

mod conn;
pub(crate) mod date;
mod generator;
mod parser;

pub use self::conn::{Http1Connection, Http1Factory, Http1Settings};
pub use self::generator::{BodyFraming, Generator};
pub use self::parser::{Parser, ParserLimits, Progress};
