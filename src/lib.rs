//! Track fuel consumption from an OTGI sensor over Bluetooth Low Energy
//!
//! The sensor sits on the vehicle and publishes two values through a single
//! GATT service:
//!
//! - A run counter, incremented each time the engine starts a new run (read once per connection)
//! - The fuel used so far in the current run, in liters (notified on change)
//!
//! From those this crate keeps a running total of fuel used since the tank
//! was last filled. The radio link is unreliable, so totals only move when
//! the run counter shows that a run has really ended. Reconnecting during
//! the same run never counts it twice.
//!
//! [`FuelGauge`] is the transport independent core and can be driven with
//! [`LinkEvent`]s directly. [`GaugeClient`] binds it to the system Bluetooth
//! adapter.
//!
//! # Example
//!
//! ```no_run
//! # #[tokio::main]
//! # pub async fn main() -> anyhow::Result<()> {
//!     let config = otgi::GaugeConfig::default();
//!     let store = otgi::JsonFileStore::new(&config.store_path);
//!     let client = otgi::GaugeClient::new(store, &config).await?;
//!     let mut reports = client.reports();
//!     tokio::spawn(client.run());
//!     while reports.changed().await.is_ok() {
//!         println!("{}", *reports.borrow());
//!     }
//! #   Ok(())
//! # }
//! ```

mod account;
mod config;
mod error;
mod gauge;
mod gauge_client;
pub mod link;
pub mod message;
mod store;

pub use account::{FuelAccount, FuelAccountant};
pub use config::{GaugeConfig, GALLONS_PER_LITER};
pub use error::FuelError;
pub use gauge::{FuelGauge, GaugeReport};
pub use gauge_client::{GaugeClient, GaugeHandle, HostRequest};
pub use link::{LinkCommand, LinkEvent, LinkState};
pub use store::{AccountStore, JsonFileStore, MemoryStore};
