//! # fometa
//!
//! A local-first metadata cache and tool server for Dynamics 365 Finance &
//! Operations.
//!
//! fometa pulls the OData `$metadata` document from an F&O instance,
//! normalizes it into entities, fields, relationships, and enumerations in a
//! local SQLite cache, and serves ranked lookups over a CLI and a JSON HTTP
//! tool API. The remote API is only ever touched by the background sync; the
//! query path is local.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌───────────┐   ┌──────────┐
//! │ F&O OData    │──▶│  Parser    │──▶│  SQLite   │
//! │ $metadata    │   │ (streaming)│   │  cache    │
//! └──────▲───────┘   └───────────┘   └────┬─────┘
//!        │ OAuth2 + retry                 │
//! ┌──────┴───────┐                        │
//! │  Scheduler   │        ┌───────────────┤
//! │ (background) │        ▼               ▼
//! └──────────────┘   ┌──────────┐   ┌──────────┐
//!                    │   CLI    │   │   HTTP   │
//!                    │ (fometa) │   │  (tools) │
//!                    └──────────┘   └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! fometa init                        # create the cache database
//! fometa sync                        # fetch and parse $metadata once
//! fometa search CustGroup            # ranked entity search
//! fometa get entity CustGroup        # full descriptor as JSON
//! fometa serve                       # background sync + HTTP tool server
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML + environment configuration |
//! | [`models`] | Core data types |
//! | [`error`] | Error taxonomy |
//! | [`auth`] | OAuth2 client-credentials token manager |
//! | [`client`] | Resilient HTTP client |
//! | [`parser`] | Streaming EDMX parser |
//! | [`store`] | SQLite metadata cache |
//! | [`sync`] | Background sync scheduler |
//! | [`server`] | JSON HTTP tool server |

pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod models;
pub mod parser;
pub mod server;
pub mod store;
pub mod sync;
