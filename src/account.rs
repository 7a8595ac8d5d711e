//! Fuel accounting across engine runs

use crate::error::FuelError;
use crate::store::AccountStore;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// The durable part of the accounting state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FuelAccount {
    /// Run counter at the last accounted run boundary
    pub last_run_counter: u64,
    /// Liters used by all completed runs since the last refuel
    pub cumulative_tank_usage: f64,
    /// Snapshot of the open trip, taken at the last checkpoint
    pub persisted_trip_usage: f64,
}

/// Owns the [`FuelAccount`] and applies sensor readings to it.
///
/// Nothing is written back to the store until [`FuelAccountant::save`] is
/// called.
pub struct FuelAccountant<S> {
    account: FuelAccount,
    /// Live estimate received since the last run boundary
    live_trip: Option<f64>,
    store: S,
}

impl<S: AccountStore> FuelAccountant<S> {
    /// Load the account from `store`
    pub fn new(store: S) -> Result<Self, FuelError> {
        let account = store.load()?;
        info!(
            "Fuel account loaded: run {}, tank usage {:.3} L, open trip {:.3} L",
            account.last_run_counter, account.cumulative_tank_usage, account.persisted_trip_usage
        );
        Ok(Self {
            account,
            live_trip: None,
            store,
        })
    }

    /// Apply a run counter reading. Returns `true` when it closed a run.
    ///
    /// A counter strictly above the last accounted one means the previous
    /// run ended; its best known usage moves into the tank total. Equal or
    /// lower counters come from a reconnect during the same run and change
    /// nothing.
    pub fn on_run_counter_update(&mut self, count: u64) -> bool {
        if count <= self.account.last_run_counter {
            debug!(
                "Run counter {count} does not pass {}, keeping open trip",
                self.account.last_run_counter
            );
            return false;
        }

        let closed = self.current_trip_usage();
        let total = self.account.cumulative_tank_usage + closed;
        if total.is_finite() {
            self.account.cumulative_tank_usage = total;
        } else {
            warn!("Tank usage would overflow, dropping closed trip {closed} L");
        }
        self.account.persisted_trip_usage = 0.0;
        self.account.last_run_counter = count;
        self.live_trip = None;

        info!(
            "Run boundary at {count}: closed trip {closed:.3} L, tank usage now {:.3} L",
            self.account.cumulative_tank_usage
        );
        true
    }

    /// Record the sensor's live estimate for the open trip.
    ///
    /// Estimates that are not finite or are below zero are refused and the
    /// previous estimate stays in place.
    pub fn on_trip_fuel_update(&mut self, liters: f64) -> Result<(), FuelError> {
        if !liters.is_finite() || liters < 0.0 {
            warn!("Refusing trip estimate {liters} L");
            return Err(FuelError::ImplausibleFuel(liters));
        }
        debug!("Live trip estimate {liters:.3} L");
        self.live_trip = Some(liters);
        Ok(())
    }

    /// Checkpoint the open trip and write the account to the store
    pub fn save(&mut self) -> Result<(), FuelError> {
        if let Some(trip) = self.live_trip {
            self.account.persisted_trip_usage = trip;
        }
        self.store.save(&self.account)?;
        debug!("Fuel account saved: {:?}", self.account);
        Ok(())
    }

    /// Mark the tank as full.
    ///
    /// Tank usage becomes the negative of the open trip, so that trip is
    /// not counted against the new tank once it closes.
    pub fn refuel(&mut self) {
        let trip = self.current_trip_usage();
        self.account.cumulative_tank_usage = -trip;
        info!("Refueled, tank usage reset to {:.3} L", self.account.cumulative_tank_usage);
    }

    /// Usage of the open trip: the live estimate, else the last checkpoint
    pub fn current_trip_usage(&self) -> f64 {
        self.live_trip.unwrap_or(self.account.persisted_trip_usage)
    }

    pub fn live_trip(&self) -> Option<f64> {
        self.live_trip
    }

    pub fn account(&self) -> &FuelAccount {
        &self.account
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}
