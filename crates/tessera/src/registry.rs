//! Process-wide mapping from URI schemes to database factories.
//!
//! Drivers register a factory under their scheme; applications then open
//! databases from a URI string without naming the driver.
//!
//! ```rust,ignore
//! tessera::register_scheme("sqlite", |uri| {
//!     let path = uri.database.clone().unwrap_or_default();
//!     Ok(Database::new(SqliteConnection::open(&path)?))
//! });
//!
//! let database = tessera::create_database("sqlite:/tmp/app.db?cache_size=500")?;
//! let store = Store::from_database(database)?;
//! ```

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use tessera_core::{Error, Result, Uri};
use tessera_session::Database;

/// Builds a connected database for a parsed URI.
pub type DatabaseFactory = Arc<dyn Fn(&Uri) -> Result<Database> + Send + Sync>;

static REGISTRY: OnceLock<RwLock<HashMap<String, DatabaseFactory>>> = OnceLock::new();

fn registry() -> &'static RwLock<HashMap<String, DatabaseFactory>> {
    REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Register `factory` for `scheme`, replacing any earlier registration.
pub fn register_scheme(
    scheme: impl Into<String>,
    factory: impl Fn(&Uri) -> Result<Database> + Send + Sync + 'static,
) {
    let scheme = scheme.into();
    tracing::debug!(scheme = %scheme, "Registered database scheme");
    registry()
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(scheme, Arc::new(factory));
}

/// Remove the factory for `scheme`. Returns whether one was registered.
pub fn unregister_scheme(scheme: &str) -> bool {
    registry()
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(scheme)
        .is_some()
}

pub fn has_scheme(scheme: &str) -> bool {
    registry()
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .contains_key(scheme)
}

/// Open a database from a URI string.
///
/// The URI is kept on the database, so stores built with
/// [`Store::from_database`](tessera_session::Store::from_database) pick up
/// its `cache`, `cache_size` and `max_flush_repeats` options.
pub fn create_database(uri: &str) -> Result<Database> {
    let uri = Uri::parse(uri)?;
    let factory = registry()
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(&uri.scheme)
        .cloned()
        .ok_or_else(|| Error::config(format!("Unknown database scheme: {}", uri.scheme)))?;
    tracing::info!(scheme = %uri.scheme, database = ?uri.database, "Creating database");
    factory(&uri)?.with_uri(uri)
}
