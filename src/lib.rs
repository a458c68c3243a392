pub mod audit;
pub mod cassandra;
pub mod config;
pub mod errors;
pub mod gssapi;
pub mod mongo;
pub mod pg;
pub mod pump;
pub mod route;
pub mod session;
pub mod tls;
pub mod util;

pub use audit::{AuditRecorder, TracingAuditRecorder};
pub use cassandra::CassandraConnection;
pub use config::{CliConfig, LogLevel, RoutesConfig};
pub use errors::ProxyError;
pub use mongo::MongoConnection;
pub use pg::PgConnection;
pub use route::{Route, RouteResolver};
pub use session::{Protocol, Session};
