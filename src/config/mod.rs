pub mod cli;
pub mod routes;
pub mod types;

pub use cli::CliConfig;
pub use routes::RoutesConfig;
pub use types::LogLevel;
