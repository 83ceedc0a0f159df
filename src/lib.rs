//! # filter-chain - country and network packet filtering for Linux
//!
//! A long-running daemon that enforces a declarative filtering policy:
//! configured CIDR networks and countries are allowed through a dedicated
//! `iptables` chain, denied countries are dropped, and the per-country
//! prefix lists come from the RIPEstat registry, materialised as kernel
//! `ipset` hash sets.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      filter-chain                        │
//! ├──────────────────────────────────────────────────────────┤
//! │  Config (serde_yaml)                                     │
//! │    └── allow networks, allow/deny countries, intervals   │
//! ├──────────────────────────────────────────────────────────┤
//! │  Fetcher (reqwest + rustls)                              │
//! │    └── RIPEstat country-resource-list, one per country   │
//! ├──────────────────────────────────────────────────────────┤
//! │  Repository (rusqlite)                                   │
//! │    └── per-country buckets: prefixes, applied, rule      │
//! ├──────────────────────────────────────────────────────────┤
//! │  Reconciler                                              │
//! │    ├── Applier  - sets + ordered rules into the chain    │
//! │    ├── Cleanup  - retract unconfigured resources         │
//! │    └── Recheck  - detect drift, re-arm the applier       │
//! ├──────────────────────────────────────────────────────────┤
//! │  Adapters (ipset / iptables CLI)                         │
//! │    └── atomic set swaps, positioned rule inserts         │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! IPv6 prefixes are fetched and stored alongside IPv4 but are not
//! installed into the kernel; enforcement is IPv4-only.
//!
//! ## Modules
//!
//! - [`config`] - YAML policy loading and validation
//! - [`countries`] - ISO 3166-1 alpha-2 code table
//! - [`exec`] - process execution seam for the CLI adapters
//! - [`fetcher`] - periodic RIPEstat refresh into the repository
//! - [`firewall`] - the dedicated `iptables` chain
//! - [`ipset`] - kernel set management
//! - [`lock`] - single-instance guard
//! - [`reconciler`] - the apply / cleanup / recheck loops
//! - [`repository`] - durable bucket store
//! - [`shutdown`] - cooperative cancellation

pub mod config;
pub mod countries;
pub mod exec;
pub mod fetcher;
pub mod firewall;
pub mod ipset;
pub mod lock;
pub mod reconciler;
pub mod repository;
pub mod shutdown;

pub use config::Config;
pub use reconciler::Reconciler;
