use otgi::link::{
    PeerId, DEVICE_NAME, FUEL_USAGE_CHARACTERISTIC_ID, RUN_COUNTER_CHARACTERISTIC_ID, SERVICE_ID,
};
use otgi::{
    FuelAccount, FuelError, FuelGauge, GaugeConfig, JsonFileStore, LinkCommand, LinkEvent,
    LinkState, MemoryStore,
};

fn peer() -> PeerId {
    PeerId("C3:7A:68:17:6B:FC".to_string())
}

fn gauge(account: FuelAccount) -> FuelGauge<MemoryStore> {
    FuelGauge::new(MemoryStore::with_account(account), &GaugeConfig::default()).unwrap()
}

/// Walk the gauge up to service discovery
fn connect(g: &mut FuelGauge<MemoryStore>) {
    g.handle(LinkEvent::RadioAvailable);
    g.handle(LinkEvent::DeviceDiscovered {
        peer: peer(),
        name: Some(DEVICE_NAME.to_string()),
    });
    let commands = g.handle(LinkEvent::Connected { peer: peer() });
    assert_eq!(commands, vec![LinkCommand::DiscoverServices { peer: peer() }]);
}

fn make_ready(g: &mut FuelGauge<MemoryStore>) {
    connect(g);
    g.handle(LinkEvent::ServicesFound(Ok(vec![SERVICE_ID])));
    g.handle(LinkEvent::CharacteristicsFound(Ok(vec![
        RUN_COUNTER_CHARACTERISTIC_ID,
        FUEL_USAGE_CHARACTERISTIC_ID,
    ])));
    assert_eq!(g.link_state(), LinkState::Ready);
}

fn trip(g: &mut FuelGauge<MemoryStore>, liters: f64) {
    g.handle(LinkEvent::ValueUpdated {
        characteristic: FUEL_USAGE_CHARACTERISTIC_ID,
        value: Ok(liters.to_le_bytes().to_vec()),
    });
}

fn run(g: &mut FuelGauge<MemoryStore>, count: u64) {
    g.handle(LinkEvent::ValueUpdated {
        characteristic: RUN_COUNTER_CHARACTERISTIC_ID,
        value: Ok(count.to_ne_bytes().to_vec()),
    });
}

#[test]
fn scenario_a_run_boundary_closes_trip() {
    let mut g = gauge(FuelAccount {
        last_run_counter: 5,
        cumulative_tank_usage: 10.0,
        persisted_trip_usage: 0.0,
    });
    make_ready(&mut g);
    run(&mut g, 5);
    trip(&mut g, 2.5);

    // Engine restarts; the next connection reads the new counter
    g.handle(LinkEvent::Disconnected { peer: peer() });
    make_ready(&mut g);
    run(&mut g, 6);

    assert_eq!(g.run_counter(), Some(6));
    assert_eq!(
        g.account(),
        &FuelAccount {
            last_run_counter: 6,
            cumulative_tank_usage: 12.5,
            persisted_trip_usage: 0.0,
        }
    );
}

#[test]
fn scenario_b_two_services_halts_discovery() {
    let mut g = gauge(FuelAccount::default());
    connect(&mut g);
    let commands = g.handle(LinkEvent::ServicesFound(Ok(vec![SERVICE_ID, SERVICE_ID])));

    assert!(commands.is_empty());
    assert_eq!(g.link_state(), LinkState::Inert);
    assert!(matches!(g.last_error(), Some(FuelError::FirmwareMismatch { found: 2, .. })));
}

#[test]
fn scenario_c_short_payload_keeps_estimate() {
    let mut g = gauge(FuelAccount::default());
    make_ready(&mut g);
    run(&mut g, 1);
    trip(&mut g, 1.25);
    g.handle(LinkEvent::ValueUpdated {
        characteristic: FUEL_USAGE_CHARACTERISTIC_ID,
        value: Ok(vec![1, 2, 3, 4]),
    });

    assert_eq!(
        g.last_error(),
        Some(&FuelError::InvalidLength { expected: 8, actual: 4 })
    );
    assert_eq!(g.live_trip_estimate(), Some(1.25));
    assert_eq!(g.link_state(), LinkState::Ready);
}

#[test]
fn scenario_d_disconnect_mid_discovery_keeps_account() {
    let account = FuelAccount {
        last_run_counter: 3,
        cumulative_tank_usage: 7.0,
        persisted_trip_usage: 0.5,
    };
    let mut g = gauge(account.clone());
    connect(&mut g);
    g.handle(LinkEvent::ServicesFound(Ok(vec![SERVICE_ID])));
    assert_eq!(g.link_state(), LinkState::DiscoveringCharacteristics);

    let commands = g.handle(LinkEvent::Disconnected { peer: peer() });
    assert_eq!(g.link_state(), LinkState::Scanning);
    assert_eq!(
        commands,
        vec![LinkCommand::Teardown, LinkCommand::StartScan { service: SERVICE_ID }]
    );
    assert_eq!(g.account(), &account);
}

#[test]
fn scenario_e_refuel_credits_open_trip() {
    let mut g = gauge(FuelAccount {
        last_run_counter: 1,
        cumulative_tank_usage: 55.0,
        persisted_trip_usage: 0.0,
    });
    make_ready(&mut g);
    run(&mut g, 1);
    trip(&mut g, 3.0);
    g.refuel();
    assert_eq!(g.account().cumulative_tank_usage, -3.0);
}

#[test]
fn reconnect_in_same_run_does_not_double_count() {
    let mut g = gauge(FuelAccount {
        last_run_counter: 4,
        cumulative_tank_usage: 2.0,
        persisted_trip_usage: 0.0,
    });
    make_ready(&mut g);
    run(&mut g, 4);
    trip(&mut g, 0.75);

    g.handle(LinkEvent::Disconnected { peer: peer() });
    make_ready(&mut g);
    run(&mut g, 4);

    assert_eq!(g.account().cumulative_tank_usage, 2.0);
    assert_eq!(g.live_trip_estimate(), Some(0.75));
}

#[test]
fn checkpoint_survives_restart() {
    let mut g = gauge(FuelAccount {
        last_run_counter: 8,
        cumulative_tank_usage: 1.0,
        persisted_trip_usage: 0.0,
    });
    make_ready(&mut g);
    run(&mut g, 8);
    trip(&mut g, 0.5);
    g.save().unwrap();
    let saved = g.store().stored().cloned().unwrap();
    assert_eq!(saved.persisted_trip_usage, 0.5);

    // Process restarts; the engine was switched off and on meanwhile
    let mut g = gauge(saved);
    assert_eq!(g.report().trip_liters, 0.5);
    make_ready(&mut g);
    run(&mut g, 9);
    assert_eq!(g.account().cumulative_tank_usage, 1.5);
    assert_eq!(g.account().persisted_trip_usage, 0.0);
}

#[test]
fn values_before_ready_are_dropped() {
    let mut g = gauge(FuelAccount::default());
    connect(&mut g);
    trip(&mut g, 9.0);
    assert_eq!(g.live_trip_estimate(), None);
}

#[test]
fn early_notification_counts_toward_new_run() {
    let mut g = gauge(FuelAccount {
        last_run_counter: 8,
        cumulative_tank_usage: 1.0,
        persisted_trip_usage: 0.5,
    });
    make_ready(&mut g);
    // The subscription delivers before the run counter read completes
    trip(&mut g, 0.01);
    assert_eq!(g.live_trip_estimate(), None);
    assert_eq!(g.report().trip_liters, 0.5);

    run(&mut g, 9);
    assert_eq!(g.account().cumulative_tank_usage, 1.5);
    assert_eq!(g.account().last_run_counter, 9);
    assert_eq!(g.live_trip_estimate(), Some(0.01));
}

#[test]
fn early_notification_in_same_run_is_kept() {
    let mut g = gauge(FuelAccount {
        last_run_counter: 8,
        cumulative_tank_usage: 1.0,
        persisted_trip_usage: 0.5,
    });
    make_ready(&mut g);
    trip(&mut g, 0.6);
    run(&mut g, 8);
    assert_eq!(g.account().cumulative_tank_usage, 1.0);
    assert_eq!(g.live_trip_estimate(), Some(0.6));
}

#[test]
fn implausible_estimate_never_reaches_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("account.json");
    let store = JsonFileStore::new(&path);
    let mut g = FuelGauge::new(store, &GaugeConfig::default()).unwrap();
    g.handle(LinkEvent::RadioAvailable);
    g.handle(LinkEvent::DeviceDiscovered {
        peer: peer(),
        name: Some(DEVICE_NAME.to_string()),
    });
    g.handle(LinkEvent::Connected { peer: peer() });
    g.handle(LinkEvent::ServicesFound(Ok(vec![SERVICE_ID])));
    g.handle(LinkEvent::CharacteristicsFound(Ok(vec![
        RUN_COUNTER_CHARACTERISTIC_ID,
        FUEL_USAGE_CHARACTERISTIC_ID,
    ])));
    g.handle(LinkEvent::ValueUpdated {
        characteristic: RUN_COUNTER_CHARACTERISTIC_ID,
        value: Ok(1u64.to_ne_bytes().to_vec()),
    });
    g.handle(LinkEvent::ValueUpdated {
        characteristic: FUEL_USAGE_CHARACTERISTIC_ID,
        value: Ok(f64::INFINITY.to_le_bytes().to_vec()),
    });
    g.save().unwrap();
    assert!(matches!(g.last_error(), Some(FuelError::ImplausibleFuel(_))));

    // Restart from the same file
    let restarted = FuelGauge::new(JsonFileStore::new(&path), &GaugeConfig::default()).unwrap();
    assert_eq!(
        restarted.account(),
        &FuelAccount {
            last_run_counter: 1,
            cumulative_tank_usage: 0.0,
            persisted_trip_usage: 0.0,
        }
    );
}
