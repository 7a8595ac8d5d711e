//! Drive a [`FuelGauge`] from a real Bluetooth adapter
//!
//! Every transport operation runs in its own task and reports back over a
//! single channel. [`GaugeClient::run`] is the only consumer of that channel,
//! so the gauge sees one event at a time in the order they arrived.

use crate::config::GaugeConfig;
use crate::gauge::{FuelGauge, GaugeReport};
use crate::link::{LinkCommand, LinkEvent, LinkState, PeerId};
use crate::store::AccountStore;
use anyhow::anyhow;
use bluest::Adapter;
use bluest::AdapterEvent;
use bluest::Characteristic;
use bluest::ConnectionEvent;
use bluest::Device;
use bluest::Service;
use bluest::Uuid;
use futures_util::pin_mut;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::future::Future;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration, Instant, Interval};
use tracing::{debug, info, warn};

/// Things the host application can ask of a running client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostRequest {
    /// The tank was filled
    Refuel,
    /// Checkpoint now, e.g. before the host is suspended
    Save,
    ClearError,
    /// Save, disconnect and return from [`GaugeClient::run`]
    Shutdown,
}

/// Cloneable handle for sending [`HostRequest`]s to a running client
#[derive(Debug, Clone)]
pub struct GaugeHandle {
    tx: mpsc::UnboundedSender<HostRequest>,
}

impl GaugeHandle {
    pub fn request(&self, request: HostRequest) -> anyhow::Result<()> {
        self.tx
            .send(request)
            .map_err(|_| anyhow!("Gauge client is no longer running"))
    }

    pub fn refuel(&self) -> anyhow::Result<()> {
        self.request(HostRequest::Refuel)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        self.request(HostRequest::Save)
    }

    pub fn shutdown(&self) -> anyhow::Result<()> {
        self.request(HostRequest::Shutdown)
    }
}

/// What the transport tasks report
enum Incoming {
    Event(LinkEvent),
    Discovered { device: Device, name: Option<String> },
    Services(Result<Vec<Service>, String>),
    Characteristics(Result<Vec<Characteristic>, String>),
}

/// An [`Incoming`] tagged with the connection it belongs to. Adapter wide
/// messages carry no connection.
struct Envelope {
    connection: Option<u64>,
    body: Incoming,
}

type Outbox = mpsc::UnboundedSender<Envelope>;

fn post(outbox: &Outbox, connection: Option<u64>, body: Incoming) -> bool {
    outbox.send(Envelope { connection, body }).is_ok()
}

fn is_stale(tag: Option<u64>, current: u64) -> bool {
    tag.is_some_and(|c| c != current)
}

/// Connection generation plus the peripherals seen by the running scan.
///
/// Generic over the device handle so it can be exercised without an adapter.
#[derive(Debug)]
struct Routing<D> {
    /// Bumped on every teardown so late results from a dead connection are dropped
    connection: u64,
    candidates: HashMap<PeerId, D>,
}

impl<D> Default for Routing<D> {
    fn default() -> Self {
        Self {
            connection: 0,
            candidates: HashMap::new(),
        }
    }
}

impl<D> Routing<D> {
    /// Tag for results of work started now
    fn tag(&self) -> Option<u64> {
        Some(self.connection)
    }

    fn accepts(&self, envelope: &Envelope) -> bool {
        !is_stale(envelope.connection, self.connection)
    }

    /// Remember a discovered peripheral while a scan is actually wanted
    fn offer(&mut self, state: LinkState, peer: PeerId, device: D) {
        if state == LinkState::Scanning {
            self.candidates.insert(peer, device);
        } else {
            debug!("Not keeping {peer} seen in {state:?}");
        }
    }

    /// Pick the device to connect to and forget the rest
    fn take(&mut self, peer: &PeerId) -> Option<D> {
        let device = self.candidates.remove(peer);
        self.candidates.clear();
        device
    }

    /// Start a new generation; everything tagged with the old one is stale
    fn teardown(&mut self) {
        self.connection += 1;
        self.candidates.clear();
    }
}

fn peer_id(device: &Device) -> PeerId {
    PeerId(format!("{:?}", device.id()))
}

pub struct GaugeClient<S> {
    adapter: Adapter,
    gauge: FuelGauge<S>,
    request_timeout: Duration,
    checkpoint: Option<Duration>,

    outbox: Outbox,
    inbox: mpsc::UnboundedReceiver<Envelope>,
    requests_tx: mpsc::UnboundedSender<HostRequest>,
    requests: mpsc::UnboundedReceiver<HostRequest>,
    reports: watch::Sender<GaugeReport>,

    routing: Routing<Device>,
    device: Option<Device>,
    services: Vec<Service>,
    characteristics: Vec<Characteristic>,
    scan_task: Option<JoinHandle<()>>,
    connection_tasks: Vec<JoinHandle<()>>,
}

impl<S: AccountStore> GaugeClient<S> {
    /// Open the default Bluetooth adapter and load the fuel account.
    pub async fn new(store: S, config: &GaugeConfig) -> anyhow::Result<Self> {
        let adapter = bluest::Adapter::default()
            .await
            .ok_or(anyhow!("Default adapter not found"))?;
        let gauge = FuelGauge::new(store, config)?;

        let (outbox, inbox) = mpsc::unbounded_channel();
        let (requests_tx, requests) = mpsc::unbounded_channel();
        let (reports, _) = watch::channel(gauge.report());

        Ok(Self {
            adapter,
            gauge,
            request_timeout: config.discovery_timeout(),
            checkpoint: config.checkpoint_interval(),
            outbox,
            inbox,
            requests_tx,
            requests,
            reports,
            routing: Routing::default(),
            device: None,
            services: Vec::new(),
            characteristics: Vec::new(),
            scan_task: None,
            connection_tasks: Vec::new(),
        })
    }

    pub fn handle(&self) -> GaugeHandle {
        GaugeHandle {
            tx: self.requests_tx.clone(),
        }
    }

    /// Receive a fresh [`GaugeReport`] whenever anything visible changes
    pub fn reports(&self) -> watch::Receiver<GaugeReport> {
        self.reports.subscribe()
    }

    pub fn gauge(&self) -> &FuelGauge<S> {
        &self.gauge
    }

    /// Run until [`HostRequest::Shutdown`], then save and disconnect.
    pub async fn run(mut self) -> anyhow::Result<()> {
        let watcher = self.watch_adapter();
        let mut checkpoint = self
            .checkpoint
            .map(|period| tokio::time::interval_at(Instant::now() + period, period));

        loop {
            tokio::select! {
                Some(envelope) = self.inbox.recv() => self.on_envelope(envelope),
                request = self.requests.recv() => match request {
                    Some(HostRequest::Shutdown) | None => break,
                    Some(request) => self.on_request(request),
                },
                _ = next_tick(&mut checkpoint) => {
                    debug!("Periodic checkpoint");
                    let _ = self.gauge.save();
                }
            }
            self.publish();
        }

        info!("Shutting down");
        watcher.abort();
        let device = self.device.take();
        self.teardown();
        let saved = self.gauge.save();
        if let Some(device) = device {
            if let Err(err) = self.adapter.disconnect_device(&device).await {
                warn!("Failed to disconnect: {err}");
            }
        }
        self.publish();
        Ok(saved?)
    }

    fn publish(&self) {
        let report = self.gauge.report();
        self.reports.send_if_modified(|current| {
            if *current == report {
                return false;
            }
            *current = report;
            true
        });
    }

    fn on_request(&mut self, request: HostRequest) {
        debug!("Host request {request:?}");
        match request {
            HostRequest::Refuel => {
                self.gauge.refuel();
                let _ = self.gauge.save();
            }
            HostRequest::Save => {
                let _ = self.gauge.save();
            }
            HostRequest::ClearError => self.gauge.clear_error(),
            HostRequest::Shutdown => {}
        }
    }

    fn on_envelope(&mut self, envelope: Envelope) {
        if !self.routing.accepts(&envelope) {
            debug!("Dropping result from a closed connection");
            return;
        }

        let event = match envelope.body {
            Incoming::Event(event) => event,
            Incoming::Discovered { device, name } => {
                let peer = peer_id(&device);
                self.routing.offer(self.gauge.link_state(), peer.clone(), device);
                LinkEvent::DeviceDiscovered { peer, name }
            }
            Incoming::Services(services) => LinkEvent::ServicesFound(services.map(|services| {
                let ids = services.iter().map(Service::uuid).collect::<Vec<_>>();
                self.services = services;
                ids
            })),
            Incoming::Characteristics(characteristics) => {
                LinkEvent::CharacteristicsFound(characteristics.map(|characteristics| {
                    let ids = characteristics.iter().map(Characteristic::uuid).collect::<Vec<_>>();
                    self.characteristics = characteristics;
                    ids
                }))
            }
        };

        for command in self.gauge.handle(event) {
            self.execute(command);
        }
    }

    fn execute(&mut self, command: LinkCommand) {
        debug!("Executing {command:?}");
        match command {
            LinkCommand::StartScan { service } => self.start_scan(service),
            LinkCommand::StopScan => {
                if let Some(task) = self.scan_task.take() {
                    task.abort();
                }
            }
            LinkCommand::Teardown => self.teardown(),
            LinkCommand::Connect { peer } => self.connect(peer),
            LinkCommand::DiscoverServices { peer } => self.discover_services(peer),
            LinkCommand::DiscoverCharacteristics { service } => {
                self.discover_characteristics(service)
            }
            LinkCommand::Read { characteristic } => self.read(characteristic),
            LinkCommand::Subscribe { characteristic } => self.subscribe(characteristic),
        }
    }

    fn teardown(&mut self) {
        if let Some(task) = self.scan_task.take() {
            task.abort();
        }
        for task in self.connection_tasks.drain(..) {
            task.abort();
        }
        self.routing.teardown();
        self.device = None;
        self.services.clear();
        self.characteristics.clear();
    }

    fn spawn_for_connection<F>(&mut self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.connection_tasks.retain(|t| !t.is_finished());
        self.connection_tasks.push(tokio::spawn(task));
    }

    /// Report adapter availability, starting with the first time it comes up
    fn watch_adapter(&self) -> JoinHandle<()> {
        let adapter = self.adapter.clone();
        let outbox = self.outbox.clone();
        tokio::spawn(async move {
            let events = match adapter.events().await {
                Ok(events) => events,
                Err(err) => {
                    warn!("Cannot watch adapter state: {err}");
                    post(&outbox, None, Incoming::Event(LinkEvent::TransportFailed(err.to_string())));
                    return;
                }
            };
            pin_mut!(events);

            match adapter.wait_available().await {
                Ok(()) => {
                    post(&outbox, None, Incoming::Event(LinkEvent::RadioAvailable));
                }
                Err(err) => warn!("Adapter never became available: {err}"),
            }

            while let Some(event) = events.next().await {
                let event = match event {
                    Ok(AdapterEvent::Unavailable) => LinkEvent::RadioUnavailable,
                    Ok(_) => LinkEvent::RadioAvailable,
                    Err(err) => {
                        warn!("Adapter event error: {err}");
                        continue;
                    }
                };
                if !post(&outbox, None, Incoming::Event(event)) {
                    break;
                }
            }
        })
    }

    fn start_scan(&mut self, service: Uuid) {
        if let Some(task) = self.scan_task.take() {
            task.abort();
        }
        let adapter = self.adapter.clone();
        let outbox = self.outbox.clone();
        self.scan_task = Some(tokio::spawn(async move {
            let required_services = [service];
            let mut adapter_events = match adapter.scan(&required_services).await {
                Ok(events) => events,
                Err(err) => {
                    warn!("Failed to start scan: {err}");
                    post(&outbox, None, Incoming::Event(LinkEvent::TransportFailed(err.to_string())));
                    return;
                }
            };
            while let Some(found) = adapter_events.next().await {
                let name = match found.device.name_async().await {
                    Ok(name) => Some(name),
                    Err(_) => found.adv_data.local_name.clone(),
                };
                let body = Incoming::Discovered {
                    device: found.device,
                    name,
                };
                if !post(&outbox, None, body) {
                    break;
                }
            }
        }));
    }

    /// Connect, then keep watching the connection so a drop is reported
    fn connect(&mut self, peer: PeerId) {
        let Some(device) = self.routing.take(&peer) else {
            post(
                &self.outbox,
                self.routing.tag(),
                Incoming::Event(LinkEvent::ConnectFailed {
                    peer,
                    reason: "device is no longer known to the adapter".to_string(),
                }),
            );
            return;
        };
        self.device = Some(device.clone());

        let adapter = self.adapter.clone();
        let outbox = self.outbox.clone();
        let connection = self.routing.tag();
        let limit = self.request_timeout;
        self.spawn_for_connection(async move {
            let connection_events = match adapter.device_connection_events(&device).await {
                Ok(events) => events,
                Err(err) => {
                    let reason = err.to_string();
                    post(&outbox, connection, Incoming::Event(LinkEvent::ConnectFailed { peer, reason }));
                    return;
                }
            };
            pin_mut!(connection_events);

            let failure = match timeout(limit, adapter.connect_device(&device)).await {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some(err.to_string()),
                Err(_) => Some(format!("connect timed out after {}s", limit.as_secs())),
            };
            if let Some(reason) = failure {
                post(&outbox, connection, Incoming::Event(LinkEvent::ConnectFailed { peer, reason }));
                return;
            }
            let connected = LinkEvent::Connected { peer: peer.clone() };
            if !post(&outbox, connection, Incoming::Event(connected)) {
                return;
            }

            while let Some(event) = connection_events.next().await {
                if matches!(event, ConnectionEvent::Disconnected) {
                    let disconnected = LinkEvent::Disconnected { peer: peer.clone() };
                    post(&outbox, connection, Incoming::Event(disconnected));
                    return;
                }
            }
        });
    }

    fn discover_services(&mut self, peer: PeerId) {
        let Some(device) = self.device.clone() else {
            warn!("No device to discover services on for {peer}");
            return;
        };
        let outbox = self.outbox.clone();
        let connection = self.routing.tag();
        let limit = self.request_timeout;
        self.spawn_for_connection(async move {
            let services = match timeout(limit, device.discover_services()).await {
                Ok(result) => result.map_err(|err| err.to_string()),
                Err(_) => Err("service discovery timed out".to_string()),
            };
            post(&outbox, connection, Incoming::Services(services));
        });
    }

    fn discover_characteristics(&mut self, service: Uuid) {
        let outbox = self.outbox.clone();
        let connection = self.routing.tag();
        let Some(service) = self.services.iter().find(|s| s.uuid() == service).cloned() else {
            post(
                &outbox,
                connection,
                Incoming::Characteristics(Err(format!("service {service} is gone"))),
            );
            return;
        };
        let limit = self.request_timeout;
        self.spawn_for_connection(async move {
            let characteristics = match timeout(limit, service.discover_characteristics()).await {
                Ok(result) => result.map_err(|err| err.to_string()),
                Err(_) => Err("characteristic discovery timed out".to_string()),
            };
            post(&outbox, connection, Incoming::Characteristics(characteristics));
        });
    }

    fn find_characteristic(&self, id: Uuid) -> Result<Characteristic, String> {
        self.characteristics
            .iter()
            .find(|c| c.uuid() == id)
            .cloned()
            .ok_or_else(|| format!("characteristic {id} is gone"))
    }

    fn read(&mut self, id: Uuid) {
        let outbox = self.outbox.clone();
        let connection = self.routing.tag();
        let characteristic = match self.find_characteristic(id) {
            Ok(characteristic) => characteristic,
            Err(reason) => {
                let event = LinkEvent::ValueUpdated { characteristic: id, value: Err(reason) };
                post(&outbox, connection, Incoming::Event(event));
                return;
            }
        };
        let limit = self.request_timeout;
        self.spawn_for_connection(async move {
            let value = match timeout(limit, characteristic.read()).await {
                Ok(result) => result.map_err(|err| err.to_string()),
                Err(_) => Err(format!("read of {id} timed out")),
            };
            let event = LinkEvent::ValueUpdated { characteristic: id, value };
            post(&outbox, connection, Incoming::Event(event));
        });
    }

    fn subscribe(&mut self, id: Uuid) {
        let outbox = self.outbox.clone();
        let connection = self.routing.tag();
        let characteristic = match self.find_characteristic(id) {
            Ok(characteristic) => characteristic,
            Err(reason) => {
                let event = LinkEvent::ValueUpdated { characteristic: id, value: Err(reason) };
                post(&outbox, connection, Incoming::Event(event));
                return;
            }
        };
        let limit = self.request_timeout;
        self.spawn_for_connection(async move {
            let mut updates = match timeout(limit, characteristic.notify()).await {
                Ok(Ok(updates)) => updates,
                Ok(Err(err)) => {
                    let event = LinkEvent::ValueUpdated { characteristic: id, value: Err(err.to_string()) };
                    post(&outbox, connection, Incoming::Event(event));
                    return;
                }
                Err(_) => {
                    let event = LinkEvent::ValueUpdated {
                        characteristic: id,
                        value: Err(format!("subscribe to {id} timed out")),
                    };
                    post(&outbox, connection, Incoming::Event(event));
                    return;
                }
            };

            while let Some(update) = updates.next().await {
                if let Ok(data) = &update {
                    debug!("RX notification from {id}: 0x{}", hex::encode(data));
                }
                let event = LinkEvent::ValueUpdated {
                    characteristic: id,
                    value: update.map_err(|err| err.to_string()),
                };
                if !post(&outbox, connection, Incoming::Event(event)) {
                    break;
                }
            }
            debug!("Notification stream for {id} ended");
        });
    }
}

/// Wait for the next checkpoint, or forever when checkpoints are off
async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
