use crate::session::{Protocol, Session};

// -----------------------------------------------------------------------------
// ----- Route -------------------------------------------------------------------

/// The resolved backend target and its connection parameters (§3). Produced
/// once per connection by the target-resolver; immutable thereafter.
#[derive(Clone, Debug)]
pub struct Route {
    pub host: String,
    pub port: u16,
    pub backend_user: String,
    pub backend_database: String,

    pub ca_path: Option<String>,
    pub server_name: Option<String>,

    pub krb5_config_path: Option<String>,
    pub ticket_cache_path: Option<String>,
    pub client_principal: Option<String>,
    pub service_principal: String,

    pub expected_username: Option<String>,
}

impl Route {
    pub fn default_service_principal(protocol: Protocol, host: &str) -> String {
        format!("{}/{host}", protocol.as_str())
    }
}

// -----------------------------------------------------------------------------
// ----- Resolver ------------------------------------------------------------------

/// Pure mapping from a Session to a Route; `None` means no match.
///
/// Implementations must be pure or internally synchronized (§5): the resolver
/// is shared across every connection on the listener.
pub trait RouteResolver: Send + Sync {
    fn resolve(&self, session: &Session) -> Option<Route>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_service_principal_is_protocol_slash_host() {
        assert_eq!(
            Route::default_service_principal(Protocol::Postgres, "pg-sales.internal"),
            "postgres/pg-sales.internal"
        );
        assert_eq!(
            Route::default_service_principal(Protocol::Cassandra, "cass.internal"),
            "cassandra/cass.internal"
        );
    }
}
