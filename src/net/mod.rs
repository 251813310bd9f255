//! Transport layer: byte channels over sockets, accepting, and the
//! per-socket connection contract.

pub mod connection;
pub mod connector;
pub mod endpoint;

pub use self::connection::{Connection, ConnectionCx, ConnectionFactory, Peer, PeerRef};
pub use self::connector::{Connector, ConnectorConfig, ExecutorSelector, RoundRobin};
pub use self::endpoint::{Chunk, Duplex, EndPoint, FileView, FlushStatus};
