// test_acquisition
// Integration test of the acquisition coordinator
// Uses the simulated ECU in xcp_ecu_sim

// cargo test --test test_acquisition -- --nocapture

use std::sync::{Arc, Once};
use std::time::Duration;

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use tokio::sync::broadcast::error::TryRecvError;

use xcp_ecu_sim::{EcuSim, DEMO_A2L, DEMO_ENGINE_SPEED_ADDR};
use xcp_monitor::a2l::{A2lDataType, Category, Conversion, ParameterDefinition};
use xcp_monitor::acquisition::{Acquisition, AcquisitionConfig, AcquisitionError, Reading};
use xcp_monitor::catalog::{EcuDescriptor, EcuId, MemoryCatalog, MemoryDescriptionSource, Signal, SignalId};
use xcp_monitor::xcp::{SessionConfig, TcpConnector, XcpError};

//-----------------------------------------------------------------------------
// Test setup

static TEST_INIT: Once = Once::new();

fn test_setup() {
    TEST_INIT.call_once(|| {
        env_logger::Builder::new().filter_level(log::LevelFilter::Info).is_test(true).init();
    });
}

const ECU_A: EcuId = 1;
const ECU_B: EcuId = 2;
const ECU_NO_A2L: EcuId = 3;

const ENGINE_SPEED: SignalId = SignalId(1);
const COOLANT_TEMP: SignalId = SignalId(2);
const UNMAPPED: SignalId = SignalId(3);

fn signal(id: SignalId, name: &str, address: u32, data_type: A2lDataType, conversion: Option<Conversion>) -> Signal {
    let mut definition = ParameterDefinition::new(name, address, data_type, Category::Measurement);
    definition.conversion = conversion;
    Signal::new(id, ECU_A, definition)
}

// Catalog with ECU_A served by sim_a and ECU_B served by sim_b
fn acquisition(port_a: u16, port_b: u16, config: AcquisitionConfig) -> (Acquisition, Arc<MemoryDescriptionSource>) {
    let mut catalog = MemoryCatalog::new();
    catalog
        .add_ecu(EcuDescriptor::new(ECU_A, "ecu_a", "127.0.0.1", port_a, "demo.a2l"))
        .add_ecu(EcuDescriptor::new(ECU_B, "ecu_b", "127.0.0.1", port_b, "demo.a2l"))
        .add_ecu(EcuDescriptor::new(ECU_NO_A2L, "ecu_no_a2l", "127.0.0.1", port_a, "missing.a2l"))
        .add_signal(signal(ENGINE_SPEED, "engine_speed", DEMO_ENGINE_SPEED_ADDR, A2lDataType::Uword, Some(Conversion::factor(0.25))))
        .add_signal(signal(COOLANT_TEMP, "coolant_temp", 0x1004, A2lDataType::Sbyte, Some(Conversion::offset(-40.0))))
        .add_signal(signal(UNMAPPED, "unmapped", 0x3000, A2lDataType::Ulong, None));

    let source = Arc::new(MemoryDescriptionSource::new());
    source.insert("demo.a2l", DEMO_A2L);
    let acquisition = Acquisition::new(Arc::new(catalog), source.clone(), Arc::new(TcpConnector), config);
    (acquisition, source)
}

async fn wait_for(what: &str, f: impl Fn() -> bool) {
    for _ in 0..100 {
        if f() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timeout waiting for {}", what);
}

async fn recv(rx: &mut tokio::sync::broadcast::Receiver<Reading>) -> Reading {
    tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.expect("no reading").expect("channel closed")
}

//-----------------------------------------------------------------------------
// Single reads

#[tokio::test]
async fn test_read_once() {
    test_setup();
    let sim = EcuSim::start_demo("127.0.0.1:0").await.unwrap();
    let (acq, _) = acquisition(sim.port(), sim.port(), AcquisitionConfig::default());
    let mut rx = acq.subscribe();

    acq.connect_ecu(ECU_A).await.unwrap();
    assert!(acq.is_connected());
    assert_eq!(sim.connect_count(), 1);

    // 3200 * 0.25
    assert_eq!(acq.read_once(ENGINE_SPEED).await.unwrap(), 800.0);
    // 90 - 40
    assert_eq!(acq.read_once(COOLANT_TEMP).await.unwrap(), 50.0);

    let r = recv(&mut rx).await;
    assert_eq!(r.signal_id, ENGINE_SPEED);
    assert_eq!(r.key.name, "engine_speed");
    assert_eq!(r.key.address, DEMO_ENGINE_SPEED_ADDR);
    assert_eq!(r.value, 800.0);
    let r = recv(&mut rx).await;
    assert_eq!(r.signal_id, COOLANT_TEMP);
    assert_eq!(r.value, 50.0);

    assert_eq!(acq.signal(ENGINE_SPEED).unwrap().current_value, Some(800.0));

    // Value changes in ECU memory are visible with the next read
    sim.memory().write_u16(DEMO_ENGINE_SPEED_ADDR, 4000);
    assert_eq!(acq.read_once(ENGINE_SPEED).await.unwrap(), 1000.0);

    assert!(matches!(acq.read_once(SignalId(42)).await, Err(AcquisitionError::UnknownSignal(SignalId(42)))));

    // A negative response fails the read, but keeps the session
    let res = acq.read_once(UNMAPPED).await;
    assert!(matches!(res, Err(AcquisitionError::Xcp(XcpError::NegativeResponse(_)))));
    assert!(acq.is_connected());

    acq.disconnect().await;
    assert!(!acq.is_connected());
    assert_eq!(sim.disconnect_count(), 1);
    assert!(matches!(acq.read_once(ENGINE_SPEED).await, Err(AcquisitionError::NotConnected)));
}

#[tokio::test]
async fn test_register_definition() {
    test_setup();
    let sim = EcuSim::start_demo("127.0.0.1:0").await.unwrap();
    let (acq, _) = acquisition(sim.port(), sim.port(), AcquisitionConfig::default());
    acq.connect_ecu(ECU_A).await.unwrap();

    let description = acq.description().unwrap();
    assert_eq!(description.project_name, "xcp_ecu_sim");
    assert_eq!(description.measurements().count(), 5);
    assert_eq!(description.characteristics().count(), 2);

    let voltage = acq.register_definition("battery_voltage").unwrap();
    assert!(voltage.0 >= xcp_monitor::acquisition::LOCAL_SIGNAL_ID_BASE);
    assert_eq!(acq.register_definition("battery_voltage").unwrap(), voltage);
    assert_eq!(acq.read_once(voltage).await.unwrap(), 13.5);
    assert_eq!(acq.signal(voltage).unwrap().display_name(), "battery_voltage (V)");

    let idle_target = acq.register_definition("idle_target").unwrap();
    assert!(acq.signal(idle_target).unwrap().definition.is_calibration());
    assert_eq!(acq.read_once(idle_target).await.unwrap(), 800.0);

    let gain = acq.register_definition("gain").unwrap();
    assert_eq!(acq.read_once(gain).await.unwrap(), 1.5);

    assert!(matches!(acq.register_definition("no_such_parameter"), Err(AcquisitionError::UnknownDefinition(_))));
}

//-----------------------------------------------------------------------------
// Session lifecycle

#[tokio::test]
async fn test_connect_twice() {
    test_setup();
    let sim_a = EcuSim::start_demo("127.0.0.1:0").await.unwrap();
    let sim_b = EcuSim::start_demo("127.0.0.1:0").await.unwrap();
    sim_b.memory().write_u16(DEMO_ENGINE_SPEED_ADDR, 8000);
    let (acq, _) = acquisition(sim_a.port(), sim_b.port(), AcquisitionConfig::default());

    acq.connect_ecu(ECU_A).await.unwrap();
    wait_for("connection to ecu_a", || sim_a.connections() == 1).await;
    assert_eq!(acq.read_once(ENGINE_SPEED).await.unwrap(), 800.0);

    // The first session is disconnected and closed before the second one is opened
    acq.connect_ecu(ECU_B).await.unwrap();
    assert_eq!(sim_a.disconnect_count(), 1);
    wait_for("ecu_a closed", || sim_a.connections() == 0).await;
    assert_eq!(sim_b.connect_count(), 1);
    assert_eq!(acq.connected_ecu().unwrap().id, ECU_B);

    // Signals are read at their address from the connected ECU, whichever ECU the catalog assigns them to
    assert_eq!(acq.read_once(ENGINE_SPEED).await.unwrap(), 2000.0);
    acq.disconnect().await;
}

#[tokio::test]
async fn test_connect_errors() {
    test_setup();

    // A port nobody listens on
    let closed_port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let (acq, _) = acquisition(closed_port, closed_port, AcquisitionConfig::default());
    assert!(matches!(acq.connect_ecu(ECU_A).await, Err(AcquisitionError::ConnectFailed(_))));
    assert!(!acq.is_connected());
    assert!(matches!(acq.connect_ecu(99).await, Err(AcquisitionError::UnknownEcu(99))));

    // Missing description, the new session is disconnected again
    let sim = EcuSim::start_demo("127.0.0.1:0").await.unwrap();
    let (acq, _) = acquisition(sim.port(), sim.port(), AcquisitionConfig::default());
    let res = acq.connect_ecu(ECU_NO_A2L).await;
    assert!(matches!(res, Err(AcquisitionError::DescriptionSource { .. })));
    assert!(!acq.is_connected());
    assert_eq!(sim.connect_count(), 1);
    assert_eq!(sim.disconnect_count(), 1);
}

#[tokio::test]
async fn test_description_cache() {
    test_setup();
    let sim = EcuSim::start_demo("127.0.0.1:0").await.unwrap();
    let (acq, source) = acquisition(sim.port(), sim.port(), AcquisitionConfig::default());

    acq.connect_ecu(ECU_A).await.unwrap();
    let d1 = acq.description().unwrap();
    acq.connect_ecu(ECU_B).await.unwrap();
    let d2 = acq.description().unwrap();
    assert!(Arc::ptr_eq(&d1, &d2));
    assert_eq!(source.read_count(), 1);

    // A new revision is decoded again
    source.insert("demo.a2l", DEMO_A2L);
    acq.connect_ecu(ECU_A).await.unwrap();
    assert_eq!(source.read_count(), 2);
    assert!(!Arc::ptr_eq(&d1, &acq.description().unwrap()));
    acq.disconnect().await;
}

#[tokio::test]
async fn test_read_timeout() {
    test_setup();
    let sim = EcuSim::start_demo("127.0.0.1:0").await.unwrap();
    let config = AcquisitionConfig {
        session: SessionConfig {
            read_timeout: Some(Duration::from_millis(50)),
            ..SessionConfig::default()
        },
        ..AcquisitionConfig::default()
    };
    let (acq, _) = acquisition(sim.port(), sim.port(), config);
    acq.connect_ecu(ECU_A).await.unwrap();

    sim.set_response_delay(Some(Duration::from_millis(500)));
    let res = acq.read_once(ENGINE_SPEED).await;
    assert!(matches!(res, Err(AcquisitionError::Xcp(XcpError::Timeout(_)))));
    assert!(!acq.is_connected());

    // Reconnect is up to the caller
    sim.set_response_delay(None);
    acq.connect_ecu(ECU_A).await.unwrap();
    assert_eq!(acq.read_once(ENGINE_SPEED).await.unwrap(), 800.0);
    acq.disconnect().await;
}

#[tokio::test]
async fn test_disconnect_stalled_ecu() {
    test_setup();
    let sim = EcuSim::start_demo("127.0.0.1:0").await.unwrap();
    let (acq, _) = acquisition(sim.port(), sim.port(), AcquisitionConfig::default());
    let acq = Arc::new(acq);

    // The ECU stops answering while the periodic task waits for a response
    acq.connect_ecu(ECU_A).await.unwrap();
    sim.set_response_delay(Some(Duration::from_secs(3600)));
    acq.start_periodic(&[ENGINE_SPEED], Duration::from_millis(10)).await;
    wait_for("periodic read sent", || sim.command_count() >= 2).await;
    tokio::time::timeout(Duration::from_secs(2), acq.disconnect()).await.expect("disconnect blocked by the periodic read");
    assert!(!acq.is_connected());
    assert!(!acq.is_periodic_running().await);

    // A single read waiting for the ECU is cancelled by disconnect
    sim.set_response_delay(None);
    acq.connect_ecu(ECU_A).await.unwrap();
    let commands = sim.command_count();
    sim.set_response_delay(Some(Duration::from_secs(3600)));
    let read = {
        let acq = acq.clone();
        tokio::spawn(async move { acq.read_once(ENGINE_SPEED).await })
    };
    wait_for("single read sent", || sim.command_count() > commands).await;
    tokio::time::timeout(Duration::from_secs(2), acq.disconnect()).await.expect("disconnect blocked by the single read");
    let res = read.await.unwrap();
    assert!(matches!(res, Err(AcquisitionError::Xcp(XcpError::Cancelled))));
    assert!(!acq.is_connected());

    // A new session is not affected by the stalled connections
    sim.set_response_delay(None);
    tokio::time::timeout(Duration::from_secs(2), acq.connect_ecu(ECU_A)).await.unwrap().unwrap();
    assert_eq!(acq.read_once(ENGINE_SPEED).await.unwrap(), 800.0);
    acq.disconnect().await;
}

//-----------------------------------------------------------------------------
// Periodic acquisition

#[tokio::test]
async fn test_periodic() {
    test_setup();
    let sim = EcuSim::start_demo("127.0.0.1:0").await.unwrap();
    let (acq, _) = acquisition(sim.port(), sim.port(), AcquisitionConfig::default());
    acq.connect_ecu(ECU_A).await.unwrap();
    let mut rx = acq.subscribe();

    acq.start_periodic(&[ENGINE_SPEED, COOLANT_TEMP], Duration::from_millis(10)).await;
    assert!(acq.signal(ENGINE_SPEED).unwrap().is_monitored);
    assert!(acq.signal(COOLANT_TEMP).unwrap().is_monitored);
    assert!(!acq.signal(UNMAPPED).unwrap().is_monitored);

    // Round robin order
    let mut readings = Vec::new();
    for _ in 0..10 {
        readings.push(recv(&mut rx).await);
    }
    for pair in readings.chunks(2) {
        assert_eq!(pair[0].signal_id, ENGINE_SPEED);
        assert_eq!(pair[0].value, 800.0);
        assert_eq!(pair[1].signal_id, COOLANT_TEMP);
        assert_eq!(pair[1].value, 50.0);
        assert!(pair[0].timestamp <= pair[1].timestamp);
    }

    acq.stop_periodic().await;
    assert!(!acq.signal(ENGINE_SPEED).unwrap().is_monitored);

    // Nothing is published after stop
    while rx.try_recv().is_ok() {}
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

    // Stop is idempotent
    acq.stop_periodic().await;
    acq.disconnect().await;
}

#[tokio::test]
async fn test_periodic_replace_and_failures() {
    test_setup();
    let sim = EcuSim::start_demo("127.0.0.1:0").await.unwrap();
    let (acq, _) = acquisition(sim.port(), sim.port(), AcquisitionConfig::default());
    acq.connect_ecu(ECU_A).await.unwrap();
    let mut rx = acq.subscribe();

    acq.start_periodic(&[COOLANT_TEMP], Duration::from_millis(10)).await;
    recv(&mut rx).await;

    // Replaces the running task, the failing signal does not stop the loop
    acq.start_periodic(&[UNMAPPED, ENGINE_SPEED], Duration::from_millis(10)).await;
    assert!(!acq.signal(COOLANT_TEMP).unwrap().is_monitored);
    while rx.try_recv().is_ok() {}
    for _ in 0..5 {
        let r = recv(&mut rx).await;
        assert_eq!(r.signal_id, ENGINE_SPEED);
    }
    assert!(acq.is_connected());

    // Disconnect stops the periodic task
    acq.disconnect().await;
    assert!(!acq.is_periodic_running().await);
    assert!(!acq.signal(ENGINE_SPEED).unwrap().is_monitored);
    assert_eq!(sim.disconnect_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_periodic_with_concurrent_reads() {
    test_setup();
    let sim = EcuSim::start_demo("127.0.0.1:0").await.unwrap();
    let (acq, _) = acquisition(sim.port(), sim.port(), AcquisitionConfig::default());
    let acq = Arc::new(acq);
    acq.connect_ecu(ECU_A).await.unwrap();
    let voltage = acq.register_definition("battery_voltage").unwrap();
    let mut rx = acq.subscribe();

    acq.start_periodic(&[ENGINE_SPEED, COOLANT_TEMP], Duration::from_millis(1)).await;

    let tasks: Vec<_> = (0..4)
        .map(|_| {
            let acq = acq.clone();
            tokio::spawn(async move {
                for _ in 0..25 {
                    assert_eq!(acq.read_once(voltage).await.unwrap(), 13.5);
                    assert_eq!(acq.read_once(COOLANT_TEMP).await.unwrap(), 50.0);
                }
            })
        })
        .collect();
    for _ in 0..20 {
        let (speed, temp, volt) = tokio::join!(acq.read_once(ENGINE_SPEED), acq.read_once(COOLANT_TEMP), acq.read_once(voltage));
        assert_eq!(speed.unwrap(), 800.0);
        assert_eq!(temp.unwrap(), 50.0);
        assert_eq!(volt.unwrap(), 13.5);
    }
    for t in tasks {
        t.await.unwrap();
    }
    assert!(acq.is_connected());
    assert!(acq.is_periodic_running().await);

    // Every published reading carries the value of its own signal
    acq.stop_periodic().await;
    let mut periodic_readings = 0;
    loop {
        let r = match rx.try_recv() {
            Ok(r) => r,
            Err(TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        };
        let expected = if r.signal_id == ENGINE_SPEED {
            800.0
        } else if r.signal_id == COOLANT_TEMP {
            50.0
        } else {
            assert_eq!(r.signal_id, voltage);
            13.5
        };
        assert_eq!(r.value, expected);
        periodic_readings += 1;
    }
    assert!(periodic_readings > 0);
    assert!(acq.is_connected());
    acq.disconnect().await;
    assert_eq!(sim.disconnect_count(), 1);
}
