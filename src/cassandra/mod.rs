//! The Cassandra engine (§1.1): native-protocol framer (legacy + v5+
//! segmented framing), handshake state machine, failed-handshake responder,
//! and message parser/encoder, sequenced by `connection::CassandraConnection`.

pub mod connection;
pub mod failed_handshake;
pub mod frame;
pub mod handshake;
pub mod message;

pub use connection::CassandraConnection;
