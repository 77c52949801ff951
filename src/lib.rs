//! Keeps an offline copy of a Raindrop.io bookmark collection in sync.
//!
//! The [`sync`] engine lists the remote catalog, reconciles it against the
//! local [`storage`] and fetches article and video [`content`] into a
//! download folder. The [`service`] layer runs the engine unattended.

pub mod config;
pub mod content;
pub mod logging;
pub mod paths;
pub mod remote;
pub mod service;
pub mod storage;
pub mod sync;
pub mod util;
