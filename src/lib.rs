//! ogpass Library
//!
//! Identity broker that federates sgID logins into an OIDC authorization
//! server and persists the server's protocol models.
//!
//! # Features
//!
//! - **Model persistence**: OIDC runtime models over a key-value store with
//!   lazy TTL, secondary-index lookups and batched grant revocation
//! - **Account directory**: pending and bound accounts keyed by email
//! - **sgID bridge**: state encoding, code exchange, userinfo and signed
//!   session assertions
//! - **Stores**: in-process (default) or `DynamoDB` (`dynamodb` feature)

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod account;
pub mod broker;
pub mod cli;
pub mod config;
pub mod error;
pub mod federation;
pub mod mailer;
pub mod model;
pub mod server;
pub mod store;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging. `RUST_LOG` overrides `level`.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Internal(e.to_string()))?,
        _ => subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| Error::Internal(e.to_string()))?,
    }

    Ok(())
}
