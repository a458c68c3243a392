use std::sync::Mutex;

use libgssapi::credential::{Cred, CredUsage};
use libgssapi::ctx::{ClientCtx, CtxFlags};
use libgssapi::name::Name;
use libgssapi::oid::{GSS_KRB5_NT_PRINCIPAL_NAME, GSS_MECH_KRB5, GSS_NT_HOSTBASED_SERVICE, OidSet};
use thiserror::Error;

use crate::route::Route;

// -----------------------------------------------------------------------------
// ----- Errors ------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum GssError {
    #[error("gssapi error: {0}")]
    Gss(#[from] libgssapi::error::Error),

    #[error("kerberos login failed: {0}")]
    Login(String),
}

// -----------------------------------------------------------------------------
// ----- Process-wide krb5 config guard (§9 process-wide state) -----------------

/// `KRB5_CONFIG` is process-global. Concurrent connections with different
/// `krb5_config_path`s racing this env var is the unresolved hazard §9 flags;
/// serializing the whole acquire-context window behind one mutex at least
/// prevents two logins from observing each other's config mid-flight.
static KRB5_ENV_LOCK: Mutex<()> = Mutex::new(());

fn with_krb5_env<T>(path: Option<&str>, cache: Option<&str>, f: impl FnOnce() -> T) -> T {
    let _guard = KRB5_ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());

    let prev_config = std::env::var("KRB5_CONFIG").ok();
    let prev_cache = std::env::var("KRB5CCNAME").ok();

    if let Some(path) = path {
        // SAFETY: serialized by KRB5_ENV_LOCK for the duration of `f`.
        unsafe { std::env::set_var("KRB5_CONFIG", path) };
    }
    if let Some(cache) = cache {
        unsafe { std::env::set_var("KRB5CCNAME", cache) };
    }

    let result = f();

    match prev_config {
        Some(v) => unsafe { std::env::set_var("KRB5_CONFIG", v) },
        None => unsafe { std::env::remove_var("KRB5_CONFIG") },
    }
    match prev_cache {
        Some(v) => unsafe { std::env::set_var("KRB5CCNAME", v) },
        None => unsafe { std::env::remove_var("KRB5CCNAME") },
    }

    result
}

// -----------------------------------------------------------------------------
// ----- GssAuthenticator (§4.7) -------------------------------------------------

/// Shared contract for both engines: a ticket-cache-backed Kerberos-5 client
/// context, scoped to one connection's lifetime. Acquisition (the login under
/// the ticket cache and the GSS context creation) happens on construction;
/// the caller is expected to build this inside `spawn_blocking` since the
/// underlying krb5/GSS calls may block on disk or network I/O (§5).
pub struct GssAuthenticator {
    ctx: ClientCtx,
}

impl GssAuthenticator {
    /// JAAS-equivalent login (`useTicketCache=true`, `doNotPrompt=true`,
    /// `refreshKrb5Config=true`, `isInitiator=true`) followed by GSS context
    /// creation with the Kerberos-5 mechanism OID (`1.2.840.113554.1.2.2`),
    /// mutual auth requested, credential delegation disabled.
    pub fn login(route: &Route) -> Result<Self, GssError> {
        with_krb5_env(
            route.krb5_config_path.as_deref(),
            route.ticket_cache_path.as_deref(),
            || Self::acquire(route),
        )
    }

    fn acquire(route: &Route) -> Result<Self, GssError> {
        let target_name = Name::new(
            route.service_principal.as_bytes(),
            Some(&GSS_NT_HOSTBASED_SERVICE),
        )
        .map_err(GssError::from)?;

        let mut mechs = OidSet::new().map_err(GssError::from)?;
        mechs.add(&GSS_MECH_KRB5).map_err(GssError::from)?;

        let client_name = route
            .client_principal
            .as_deref()
            .map(client_principal_name)
            .transpose()?;

        let cred = Cred::acquire(client_name.as_ref(), None, CredUsage::Initiate, Some(&mechs))
            .map_err(|e| GssError::Login(e.to_string()))?;

        let ctx = ClientCtx::new(
            cred,
            target_name,
            CtxFlags::GSS_C_MUTUAL_FLAG,
            Some(&GSS_MECH_KRB5),
        );

        Ok(Self { ctx })
    }

    /// `initSecContext(empty)`: the first token to present to the backend.
    pub fn initial_token(&mut self) -> Result<Vec<u8>, GssError> {
        let token = self.ctx.step(None).map_err(GssError::from)?;
        Ok(token.map(|b| b.to_vec()).unwrap_or_default())
    }

    /// `initSecContext(serverToken)`: feed the server's challenge, get the
    /// continuation (or empty, once the context is fully established).
    pub fn challenge(&mut self, server_token: &[u8]) -> Result<Vec<u8>, GssError> {
        let token = self.ctx.step(Some(server_token)).map_err(GssError::from)?;
        Ok(token.map(|b| b.to_vec()).unwrap_or_default())
    }
}

/// Builds the GSS name for the proxy's own login identity (the optional
/// `principal=<clientPrincipal>` JAAS option, spec.md §4.7). This is a
/// Kerberos principal (`user@REALM` form), not a host-based service name —
/// that name-type is only for `target_name`, the backend's identity.
fn client_principal_name(principal: &str) -> Result<Name, GssError> {
    Name::new(principal.as_bytes(), Some(&GSS_KRB5_NT_PRINCIPAL_NAME)).map_err(GssError::from)
}
