//! Connection lifecycle for the OTGI sensor
//!
//! [`LinkMachine`] is driven entirely by [`LinkEvent`]s and answers each one
//! with a [`Transition`]: the requests the transport should carry out next,
//! plus any readings or error the event produced. It never touches the radio
//! itself, which keeps every path testable without hardware.

use crate::error::FuelError;
use crate::message::{decode_fuel_usage, decode_run_counter};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Advertised name of the sensor
pub const DEVICE_NAME: &str = "OTGI";
/// The single service the sensor exposes, also used as the scan filter
pub const SERVICE_ID: Uuid = Uuid::from_u128(0x2CBC6002_370F_577A_9286_81E04F368400);
/// Read-once characteristic holding the engine run counter
pub const RUN_COUNTER_CHARACTERISTIC_ID: Uuid =
    Uuid::from_u128(0xED0CDAA9_FC55_C2C1_93A0_61B6E1F36720);
/// Notifying characteristic holding the open trip's fuel estimate
pub const FUEL_USAGE_CHARACTERISTIC_ID: Uuid =
    Uuid::from_u128(0x56C46FEF_9039_0803_A71F_EEBCC8650E43);

const EXPECTED_SERVICES: usize = 1;
const EXPECTED_CHARACTERISTICS: usize = 2;

/// Transport-assigned identity of a peripheral
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerId(pub String);

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Radio unavailable
    Idle,
    Scanning,
    Connecting,
    DiscoveringServices,
    DiscoveringCharacteristics,
    /// Values are flowing
    Ready,
    /// Connected, but discovery was abandoned. Waits for a disconnect.
    Inert,
}

impl LinkState {
    /// Whether a peripheral is attached in this state
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            LinkState::DiscoveringServices
                | LinkState::DiscoveringCharacteristics
                | LinkState::Ready
                | LinkState::Inert
        )
    }
}

/// The accepted peripheral and the handles negotiated with it so far
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceLink {
    pub peer: PeerId,
    pub service: Option<Uuid>,
    pub run_counter_characteristic: Option<Uuid>,
    pub fuel_usage_characteristic: Option<Uuid>,
    /// Whether this connection's run counter has been decoded yet
    pub run_counter_seen: bool,
    /// Newest fuel estimate that arrived before the run counter
    held_trip: Option<f64>,
}

impl DeviceLink {
    fn new(peer: PeerId) -> Self {
        Self {
            peer,
            service: None,
            run_counter_characteristic: None,
            fuel_usage_characteristic: None,
            run_counter_seen: false,
            held_trip: None,
        }
    }
}

/// Everything the transport can report
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    RadioAvailable,
    RadioUnavailable,
    DeviceDiscovered { peer: PeerId, name: Option<String> },
    Connected { peer: PeerId },
    ConnectFailed { peer: PeerId, reason: String },
    Disconnected { peer: PeerId },
    ServicesFound(Result<Vec<Uuid>, String>),
    CharacteristicsFound(Result<Vec<Uuid>, String>),
    ValueUpdated {
        characteristic: Uuid,
        value: Result<Vec<u8>, String>,
    },
    /// A transport request failed outside of any negotiation step
    TransportFailed(String),
}

/// Requests for the transport
#[derive(Debug, Clone, PartialEq)]
pub enum LinkCommand {
    StartScan { service: Uuid },
    StopScan,
    /// Drop the scan, the connection watch and any subscription
    Teardown,
    Connect { peer: PeerId },
    DiscoverServices { peer: PeerId },
    DiscoverCharacteristics { service: Uuid },
    Read { characteristic: Uuid },
    Subscribe { characteristic: Uuid },
}

/// A decoded sensor value
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reading {
    RunCounter(u64),
    TripFuel(f64),
}

/// Outcome of one event
#[derive(Debug, Default, PartialEq)]
pub struct Transition {
    pub commands: Vec<LinkCommand>,
    /// Decoded values, in the order they must be applied
    pub readings: Vec<Reading>,
    pub error: Option<FuelError>,
}

impl Transition {
    fn command(command: LinkCommand) -> Self {
        Self {
            commands: vec![command],
            ..Default::default()
        }
    }

    fn error(error: FuelError) -> Self {
        Self {
            error: Some(error),
            ..Default::default()
        }
    }
}

#[derive(Debug)]
pub struct LinkMachine {
    state: LinkState,
    link: Option<DeviceLink>,
}

impl Default for LinkMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkMachine {
    pub fn new() -> Self {
        Self {
            state: LinkState::Idle,
            link: None,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn link(&self) -> Option<&DeviceLink> {
        self.link.as_ref()
    }

    /// Advance the machine by one event
    pub fn handle(&mut self, event: LinkEvent) -> Transition {
        match event {
            LinkEvent::RadioAvailable => self.on_radio_available(),
            LinkEvent::RadioUnavailable => self.on_radio_unavailable(),
            LinkEvent::DeviceDiscovered { peer, name } => self.on_discovered(peer, name),
            LinkEvent::Connected { peer } => self.on_connected(peer),
            LinkEvent::ConnectFailed { peer, reason } => self.on_connect_failed(peer, reason),
            LinkEvent::Disconnected { peer } => self.on_disconnected(peer),
            LinkEvent::ServicesFound(services) => self.on_services(services),
            LinkEvent::CharacteristicsFound(characteristics) => {
                self.on_characteristics(characteristics)
            }
            LinkEvent::ValueUpdated {
                characteristic,
                value,
            } => self.on_value(characteristic, value),
            LinkEvent::TransportFailed(reason) => {
                warn!("Transport failure in {:?}: {reason}", self.state);
                Transition::error(FuelError::Transport(reason))
            }
        }
    }

    fn set_state(&mut self, state: LinkState) {
        if self.state != state {
            debug!("Link {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }

    fn rescan(&mut self) -> Transition {
        self.link = None;
        self.set_state(LinkState::Scanning);
        Transition {
            commands: vec![
                LinkCommand::Teardown,
                LinkCommand::StartScan {
                    service: SERVICE_ID,
                },
            ],
            ..Default::default()
        }
    }

    fn is_current_peer(&self, peer: &PeerId) -> bool {
        self.link.as_ref().is_some_and(|l| &l.peer == peer)
    }

    fn on_radio_available(&mut self) -> Transition {
        if self.state != LinkState::Idle {
            return Transition::default();
        }
        info!("Bluetooth is on, scanning for {DEVICE_NAME}");
        self.rescan()
    }

    fn on_radio_unavailable(&mut self) -> Transition {
        warn!("Bluetooth not available");
        self.link = None;
        self.set_state(LinkState::Idle);
        Transition {
            commands: vec![LinkCommand::Teardown],
            error: Some(FuelError::TransportUnavailable),
            ..Default::default()
        }
    }

    fn on_discovered(&mut self, peer: PeerId, name: Option<String>) -> Transition {
        if self.state != LinkState::Scanning {
            return Transition::default();
        }
        if name.as_deref() != Some(DEVICE_NAME) {
            debug!("Ignoring {peer} ({name:?})");
            return Transition::default();
        }

        info!("Found {DEVICE_NAME} at {peer}, connecting");
        self.link = Some(DeviceLink::new(peer.clone()));
        self.set_state(LinkState::Connecting);
        Transition {
            commands: vec![LinkCommand::StopScan, LinkCommand::Connect { peer }],
            ..Default::default()
        }
    }

    fn on_connected(&mut self, peer: PeerId) -> Transition {
        if self.state != LinkState::Connecting || !self.is_current_peer(&peer) {
            return Transition::default();
        }
        info!("Connected to {peer}");
        self.set_state(LinkState::DiscoveringServices);
        Transition::command(LinkCommand::DiscoverServices { peer })
    }

    fn on_connect_failed(&mut self, peer: PeerId, reason: String) -> Transition {
        if self.state != LinkState::Connecting || !self.is_current_peer(&peer) {
            return Transition::default();
        }
        warn!("Failed to connect to {peer}: {reason}");
        let mut transition = self.rescan();
        transition.error = Some(FuelError::Transport(reason));
        transition
    }

    fn on_disconnected(&mut self, peer: PeerId) -> Transition {
        if !self.is_current_peer(&peer) {
            return Transition::default();
        }
        // Accounting is only settled by the next run counter, not here
        info!("Disconnected from {peer}, scanning again");
        self.rescan()
    }

    fn on_services(&mut self, services: Result<Vec<Uuid>, String>) -> Transition {
        if self.state != LinkState::DiscoveringServices {
            return Transition::default();
        }
        let services = match services {
            Ok(services) => services,
            Err(reason) => return self.abandon(FuelError::Transport(reason)),
        };
        let &[service] = services.as_slice() else {
            return self.abandon(FuelError::FirmwareMismatch {
                what: "services",
                expected: EXPECTED_SERVICES,
                found: services.len(),
            });
        };

        if let Some(link) = self.link.as_mut() {
            link.service = Some(service);
        }
        self.set_state(LinkState::DiscoveringCharacteristics);
        Transition::command(LinkCommand::DiscoverCharacteristics { service })
    }

    fn on_characteristics(&mut self, characteristics: Result<Vec<Uuid>, String>) -> Transition {
        if self.state != LinkState::DiscoveringCharacteristics {
            return Transition::default();
        }
        let characteristics = match characteristics {
            Ok(characteristics) => characteristics,
            Err(reason) => return self.abandon(FuelError::Transport(reason)),
        };
        let mismatch = FuelError::FirmwareMismatch {
            what: "characteristics",
            expected: EXPECTED_CHARACTERISTICS,
            found: characteristics.len(),
        };
        if characteristics.len() != EXPECTED_CHARACTERISTICS {
            return self.abandon(mismatch);
        }
        let run_counter = characteristics
            .iter()
            .copied()
            .find(|c| *c == RUN_COUNTER_CHARACTERISTIC_ID);
        let fuel_usage = characteristics
            .iter()
            .copied()
            .find(|c| *c == FUEL_USAGE_CHARACTERISTIC_ID);
        let (Some(run_counter), Some(fuel_usage)) = (run_counter, fuel_usage) else {
            warn!("Unexpected characteristics {characteristics:?}");
            return self.abandon(mismatch);
        };

        if let Some(link) = self.link.as_mut() {
            link.run_counter_characteristic = Some(run_counter);
            link.fuel_usage_characteristic = Some(fuel_usage);
        }
        info!("Link ready");
        self.set_state(LinkState::Ready);
        Transition {
            commands: vec![
                LinkCommand::Read {
                    characteristic: run_counter,
                },
                LinkCommand::Subscribe {
                    characteristic: fuel_usage,
                },
            ],
            ..Default::default()
        }
    }

    fn on_value(&mut self, characteristic: Uuid, value: Result<Vec<u8>, String>) -> Transition {
        if self.state != LinkState::Ready {
            debug!("Dropping value for {characteristic} in {:?}", self.state);
            return Transition::default();
        }
        let value = match value {
            Ok(value) => value,
            Err(reason) => {
                warn!("Error in updating value for {characteristic}: {reason}");
                return Transition::error(FuelError::Transport(reason));
            }
        };

        let Some(link) = self.link.as_mut() else {
            return Transition::default();
        };
        let is_run_counter = link.run_counter_characteristic == Some(characteristic);
        let decoded = if is_run_counter {
            decode_run_counter(&value).map(Reading::RunCounter)
        } else if link.fuel_usage_characteristic == Some(characteristic) {
            decode_fuel_usage(&value).map(Reading::TripFuel)
        } else {
            debug!("Ignoring value for unknown characteristic {characteristic}");
            return Transition::default();
        };

        let reading = match decoded {
            Ok(reading) => reading,
            Err(err) => {
                warn!("Failed to decode 0x{} from {characteristic}: {err}", hex::encode(&value));
                return Transition::error(err);
            }
        };

        // A fuel estimate belongs to the run named by this connection's
        // counter, so it waits until that counter has been applied.
        let mut readings = Vec::with_capacity(2);
        match reading {
            Reading::TripFuel(liters) if !link.run_counter_seen => {
                debug!("Holding trip estimate {liters} until the run counter arrives");
                link.held_trip = Some(liters);
            }
            Reading::RunCounter(_) => {
                readings.push(reading);
                if !link.run_counter_seen {
                    link.run_counter_seen = true;
                    readings.extend(link.held_trip.take().map(Reading::TripFuel));
                }
            }
            Reading::TripFuel(_) => readings.push(reading),
        }
        Transition {
            readings,
            ..Default::default()
        }
    }

    /// Stop negotiating with the current peripheral and wait for it to drop
    fn abandon(&mut self, error: FuelError) -> Transition {
        warn!("{error}; is this the right device, or has its firmware changed?");
        self.set_state(LinkState::Inert);
        Transition::error(error)
    }
}
