//! Solo core library: identities, marker store, configuration, errors.
//!
//! Public API surface:
//! - [`types`]: [`Identity`], [`Secret`], [`MarkerRecord`], [`ActivationRequest`]
//! - [`marker`]: [`MarkerStore`] create / find / remove
//! - [`config`]: paths and [`SingletonConfig`]
//! - [`error`]: [`SoloError`]

pub mod config;
pub mod error;
pub mod marker;
pub mod types;

pub use config::{MismatchPolicy, SingletonConfig, WireEncoding};
pub use error::SoloError;
pub use marker::MarkerStore;
pub use types::{ActivationRequest, Identity, MarkerRecord, Secret, PROP_CONFIG_HASH, PROP_USER};
