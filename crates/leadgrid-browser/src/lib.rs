//! Browser automation for the map search surface.
//!
//! Provides headless Chromium sessions with randomized fingerprints and a
//! small page-action trait the collectors are written against.

pub mod actions;
pub mod engine;
pub mod error;
pub mod fingerprint;

pub use actions::{is_consent_url, BrowserActions, SessionFactory};
pub use engine::{BrowserEngine, BrowserSession};
pub use error::{BrowserError, Result};
pub use fingerprint::FingerprintConfig;
