use std::{
    env::{self, VarError},
    time::Duration,
};

use rearch::{CData, CapsuleHandle, Container};
use sea_orm::{ConnectOptions, Database, DbConn};
use thiserror::Error;
use tracing::{info, instrument, warn};
use tracing_subscriber::EnvFilter;
use url::Url;

/// Installs the global `tracing` subscriber, honoring `RUST_LOG` (default `info`).
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
}

/// # Errors
/// Will return [`Err`] if the connection to the database fails.
#[instrument]
pub async fn init_container() -> anyhow::Result<Container> {
    info!("Initializing container");
    let container = Container::new();

    let (db_connection_options, set_db_conn) =
        container.read((db_connection_options_capsule, db_conn_init_action));

    info!(?db_connection_options, "Connecting to database");
    set_db_conn(Database::connect(db_connection_options).await?);

    info!("Container initialized");
    Ok(container)
}

/// # Panics
/// Panics when `DB_URL` is not set, or either variable is invalid.
#[must_use]
pub fn db_connection_options_capsule(_: CapsuleHandle) -> ConnectOptions {
    const URL_VAR_NAME: &str = "DB_URL";
    const MAX_CONNECTIONS_VAR_NAME: &str = "DB_MAX_CONNECTIONS";
    const DEFAULT_MAX_CONNECTIONS: u32 = 10;

    let url = optional_env_var(URL_VAR_NAME)
        .unwrap_or_else(|| panic!("{URL_VAR_NAME} is not set"));
    let max_connections = optional_env_var(MAX_CONNECTIONS_VAR_NAME).map_or(
        DEFAULT_MAX_CONNECTIONS,
        |raw| {
            raw.parse()
                .unwrap_or_else(|err| panic!("{MAX_CONNECTIONS_VAR_NAME} is invalid: {err}"))
        },
    );

    let mut options = ConnectOptions::new(url);
    options.max_connections(max_connections);
    options
}

fn db_conn_manager(
    CapsuleHandle { register, .. }: CapsuleHandle,
) -> (Option<DbConn>, impl use<> + CData + Fn(Option<DbConn>)) {
    register.register(rearch_effects::state::<rearch_effects::Cloned<_>>(None))
}

pub fn db_conn_init_action(
    CapsuleHandle { mut get, .. }: CapsuleHandle,
) -> impl use<> + CData + Fn(DbConn) {
    let set_db_conn = get.as_ref(db_conn_manager).1.clone();
    move |db| set_db_conn(Some(db))
}

/// # Panics
/// Panics when the [`DbConn`] was not set via [`db_conn_init_action`].
pub fn db_conn_capsule(CapsuleHandle { mut get, .. }: CapsuleHandle) -> DbConn {
    let db_conn = get.as_ref(db_conn_manager).0.clone();
    db_conn.expect("DbConn should've been set via db_conn_init_action!")
}

/// # Panics
/// Panics when environment variable is invalid.
pub fn addr_capsule(_: CapsuleHandle) -> String {
    const ENV_VAR_NAME: &str = "ADDR";
    const DEFAULT_ADDR: &str = "127.0.0.1:4000";

    if let Some(addr) = optional_env_var(ENV_VAR_NAME) {
        info!(addr, "{ENV_VAR_NAME} environment variable set");
        addr
    } else {
        warn!(
            addr = DEFAULT_ADDR,
            "{ENV_VAR_NAME} environment variable not set; defaulting to {DEFAULT_ADDR}"
        );
        DEFAULT_ADDR.to_owned()
    }
}

/// The public origin that QR payloads point at; redirect URLs are `<base>/redirect/<id>`.
///
/// # Panics
/// Panics when `BASE_URL` is not set or is not an absolute http(s) URL.
pub fn base_url_capsule(_: CapsuleHandle) -> Url {
    const ENV_VAR_NAME: &str = "BASE_URL";

    let raw = optional_env_var(ENV_VAR_NAME).unwrap_or_else(|| panic!("{ENV_VAR_NAME} is not set"));
    let base_url =
        parse_base_url(&raw).unwrap_or_else(|err| panic!("{ENV_VAR_NAME} is invalid: {err}"));
    info!(%base_url, "Using base URL for redirect payloads");
    base_url
}

/// # Panics
/// Panics when environment variable is not a whole number of seconds.
pub fn request_timeout_capsule(_: CapsuleHandle) -> Duration {
    const ENV_VAR_NAME: &str = "REQUEST_TIMEOUT_SECS";
    const DEFAULT_SECS: u64 = 30;

    let secs = optional_env_var(ENV_VAR_NAME).map_or(DEFAULT_SECS, |raw| {
        raw.parse()
            .unwrap_or_else(|err| panic!("{ENV_VAR_NAME} is invalid: {err}"))
    });
    Duration::from_secs(secs)
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BaseUrlError {
    #[error("{0}")]
    Parse(#[from] url::ParseError),
    #[error("scheme must be http or https, but was {0}")]
    UnsupportedScheme(String),
    #[error("must not carry a query or fragment")]
    HasQueryOrFragment,
}

/// # Errors
/// Will return [`Err`] if `raw` is not an absolute http(s) URL without query or fragment.
pub fn parse_base_url(raw: &str) -> Result<Url, BaseUrlError> {
    let url = Url::parse(raw.trim())?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(BaseUrlError::UnsupportedScheme(url.scheme().to_owned()));
    }
    if url.query().is_some() || url.fragment().is_some() {
        return Err(BaseUrlError::HasQueryOrFragment);
    }
    Ok(url)
}

/// Returns [`None`] when unset.
///
/// # Panics
/// Panics when environment variable is not valid unicode.
fn optional_env_var(name: &str) -> Option<String> {
    match env::var(name) {
        Ok(value) => Some(value),
        Err(VarError::NotPresent) => None,
        Err(VarError::NotUnicode(actual)) => {
            panic!("{name} environment variable is invalid: {}", actual.display());
        }
    }
}
