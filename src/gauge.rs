//! The fuel gauge: link negotiation feeding the fuel account

use crate::account::{FuelAccount, FuelAccountant};
use crate::config::{GaugeConfig, GALLONS_PER_LITER};
use crate::error::FuelError;
use crate::link::{LinkCommand, LinkEvent, LinkMachine, LinkState, Reading};
use crate::store::AccountStore;
use std::fmt;
use tracing::error;

/// Snapshot of everything a display needs
#[derive(Debug, Clone, PartialEq)]
pub struct GaugeReport {
    pub link_state: LinkState,
    pub radio_available: bool,
    /// Last run counter received on this connection
    pub run_counter: Option<u64>,
    /// Live estimate from the sensor, if one arrived since the last run boundary
    pub live_trip_liters: Option<f64>,
    /// Open trip usage, falling back to the last checkpoint
    pub trip_liters: f64,
    pub tank_usage_liters: f64,
    pub remaining_liters: f64,
    pub remaining_gallons: f64,
    pub remaining_miles: f64,
    pub last_error: Option<FuelError>,
}

impl fmt::Display for GaugeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let radio = if self.radio_available { "on" } else { "off" };
        let run = self
            .run_counter
            .map_or_else(|| "none".to_string(), |r| r.to_string());
        write!(
            f,
            "bluetooth {radio}, link {:?}, run {run}, trip {:.3} L, remaining {:.2} gal ({:.0} mi)",
            self.link_state, self.trip_liters, self.remaining_gallons, self.remaining_miles
        )?;
        if let Some(err) = &self.last_error {
            write!(f, ", last error: {err}")?;
        }
        Ok(())
    }
}

pub struct FuelGauge<S> {
    machine: LinkMachine,
    accountant: FuelAccountant<S>,
    radio_available: bool,
    run_counter: Option<u64>,
    last_error: Option<FuelError>,
    tank_capacity_liters: f64,
    fuel_economy_mpg: f64,
}

impl<S: AccountStore> FuelGauge<S> {
    /// Load the account from `store` and start idle
    pub fn new(store: S, config: &GaugeConfig) -> Result<Self, FuelError> {
        Ok(Self {
            machine: LinkMachine::new(),
            accountant: FuelAccountant::new(store)?,
            radio_available: false,
            run_counter: None,
            last_error: None,
            tank_capacity_liters: config.tank_capacity_liters,
            fuel_economy_mpg: config.fuel_economy_mpg,
        })
    }

    /// Apply one transport event and return what the transport should do next
    pub fn handle(&mut self, event: LinkEvent) -> Vec<LinkCommand> {
        match event {
            LinkEvent::RadioAvailable => self.radio_available = true,
            LinkEvent::RadioUnavailable => self.radio_available = false,
            _ => {}
        }

        let transition = self.machine.handle(event);

        if !self.machine.state().is_connected() {
            self.run_counter = None;
        }
        for reading in transition.readings {
            match reading {
                Reading::RunCounter(count) => {
                    self.run_counter = Some(count);
                    self.accountant.on_run_counter_update(count);
                }
                Reading::TripFuel(liters) => {
                    if let Err(err) = self.accountant.on_trip_fuel_update(liters) {
                        self.last_error = Some(err);
                    }
                }
            }
        }
        if let Some(err) = transition.error {
            self.last_error = Some(err);
        }

        transition.commands
    }

    /// Checkpoint the open trip and persist the account
    pub fn save(&mut self) -> Result<(), FuelError> {
        self.accountant.save().inspect_err(|err| {
            error!("Failed to save fuel account: {err}");
            self.last_error = Some(err.clone());
        })
    }

    /// The user filled the tank
    pub fn refuel(&mut self) {
        self.accountant.refuel();
    }

    pub fn clear_error(&mut self) {
        self.last_error = None;
    }

    pub fn link_state(&self) -> LinkState {
        self.machine.state()
    }

    pub fn radio_available(&self) -> bool {
        self.radio_available
    }

    pub fn run_counter(&self) -> Option<u64> {
        self.run_counter
    }

    pub fn live_trip_estimate(&self) -> Option<f64> {
        self.accountant.live_trip()
    }

    pub fn last_error(&self) -> Option<&FuelError> {
        self.last_error.as_ref()
    }

    pub fn account(&self) -> &FuelAccount {
        self.accountant.account()
    }

    pub fn store(&self) -> &S {
        self.accountant.store()
    }

    pub fn report(&self) -> GaugeReport {
        let trip_liters = self.accountant.current_trip_usage();
        let tank_usage_liters = self.account().cumulative_tank_usage;
        let remaining_liters = self.tank_capacity_liters - tank_usage_liters - trip_liters;
        let remaining_gallons = remaining_liters * GALLONS_PER_LITER;

        GaugeReport {
            link_state: self.link_state(),
            radio_available: self.radio_available,
            run_counter: self.run_counter,
            live_trip_liters: self.accountant.live_trip(),
            trip_liters,
            tank_usage_liters,
            remaining_liters,
            remaining_gallons,
            remaining_miles: remaining_gallons * self.fuel_economy_mpg,
            last_error: self.last_error.clone(),
        }
    }
}
