//! The PostgreSQL engine (§1.1): frame splitter, frontend message
//! parser/encoder, frontend state machine, backend handshake driver, and
//! backend audit observer, sequenced by `connection::PgConnection`.

pub mod audit_observer;
pub mod backend;
pub mod connection;
pub mod frame;
pub mod frontend;
pub mod message;

pub use connection::PgConnection;
