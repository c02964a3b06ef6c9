#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
//! `ModKit` row-level security context.
//!
//! Publishes a request-scoped database handle whose every operation runs in a
//! transaction preceded by the request's session settings:
//!
//! - the decoded token claims, as JSON text, in a configurable session key
//!   (`set_config(key, claims, true)`),
//! - the request's database role (`SET LOCAL ROLE`), taken from a token claim
//!   or the configured default.
//!
//! Token signatures are NOT verified here; tokens must come from an upstream
//! authentication layer.
//!
//! # Example
//!
//! ```ignore
//! use modkit_rls::{ProcessClient, RlsConfig, RlsState, UrlConnector, rls_context, Rls};
//!
//! let config = RlsConfig::from_figment(&figment, "rls")?.resolve()?;
//! let client = Arc::new(ProcessClient::new(
//!     Arc::new(UrlConnector::new(ConnectOptions::new(url))),
//!     config.startup_role().cloned(),
//! ));
//!
//! let app = Router::new()
//!     .route("/notes", get(list_notes))
//!     .layer(middleware::from_fn_with_state(
//!         RlsState::new(config, client),
//!         rls_context,
//!     ));
//! ```

pub mod claims;
pub mod client;
pub mod config;
pub mod context;
pub mod errors;
pub mod role;
pub mod scoped;
pub mod token;

#[cfg(feature = "axum-ext")]
pub mod middleware;

pub use claims::{ClaimValue, Claims};
pub use client::{DbConnector, ProcessClient, UrlConnector};
pub use config::{ModuleConfig, Preset, RlsConfig};
pub use context::SecurityContext;
pub use errors::{ConfigError, DecodeError, InvalidRoleError, RlsError};
pub use role::{DbRole, resolve_role};
pub use scoped::{RlsDb, RlsRunner, SessionScope};
pub use token::{decode_payload, encode_unsigned};

#[cfg(feature = "axum-ext")]
pub use middleware::{RequestAttributes, Rls, RlsState, rls_context};
