//! nas-tunnel - WireGuard tunnel coordination around TrueNAS replication
//!
//! A replication target is reachable only through a WireGuard tunnel that
//! should be up for the replication window and down the rest of the time.
//! This crate provides the pieces of that pipeline:
//!
//! - `tunnel`: WireGuard interface control (`wg`, `wg-quick`)
//! - `jobs`: replication job inspection (middleware job list or process table)
//! - `monitor`: the shutdown monitor that waits for replication to finish,
//!   then takes the tunnel down
//! - `export`: configuration database export with age-based retention
//! - `health`: replication freshness check with Uptime Kuma push
//! - `config`: configuration file handling (TOML)
//!
//! # Usage
//!
//! Typical cron pipeline on the appliance:
//! ```bash
//! nas-tunnel up wg0
//! nas-tunnel export /mnt/tank/config-backups --include-secret
//! # ... replication task runs ...
//! nas-tunnel down wg0 --timeout 600 --interval 15
//! ```

pub mod command;
pub mod config;
pub mod export;
pub mod health;
pub mod jobs;
pub mod monitor;
pub mod tunnel;

pub use config::Config;
pub use jobs::{JobInspector, PollResult};
pub use monitor::{MonitorReport, MonitorSettings, Outcome, ShutdownMonitor};
pub use tunnel::{TunnelController, TunnelHandle, TunnelSelector};
