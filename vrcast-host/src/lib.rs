//! # vrcast-host
//!
//! Host process for the vrcast pipeline. Reads orientation samples from
//! stdin, polls the shared hand-tracking file, captures the desktop and
//! writes the framed stream to stdout.
//!
//! ## Modules
//!
//! | Module | Responsibility |
//! |--------|---------------|
//! | [`config`] | TOML configuration with defaults |
//! | [`service`] | Run loop, headless scene host, stream inspector |

pub mod config;
pub mod service;
