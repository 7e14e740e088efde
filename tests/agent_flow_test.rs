// Integration tests for the agent flow against the in-memory ledger

use field_agent::config::AgentConfig;
use field_agent::device::{Device, DeviceState};
use field_agent::events::DomainEventKind;
use field_agent::ledger::{MemoryLedger, Topic};
use field_agent::model::{Asset, DeviceModel, Location, Metric, Requirements};
use field_agent::sensor::{Sensor, StaticSensorMock};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

const DEVICE_ID: &str = "agent-7";

fn device_model() -> DeviceModel {
    DeviceModel {
        id: DEVICE_ID.to_string(),
        name: "warehouse agent".to_string(),
        hostname: String::new(),
        location: Location::new(52.52, 13.405),
        supports: vec![],
    }
}

fn asset(id: &str, latitude: f64, longitude: f64) -> Asset {
    Asset {
        id: id.to_string(),
        name: "pallet".to_string(),
        sku: Some("SKU-1".to_string()),
        location: Location::new(latitude, longitude),
    }
}

fn requirements(id: &str, asset_id: &str, metrics: &[&str], period: u64) -> Requirements {
    Requirements {
        id: id.to_string(),
        asset_id: asset_id.to_string(),
        metrics: metrics.iter().map(|m| Metric::from(*m)).collect(),
        period,
    }
}

fn posted_for(ledger: &MemoryLedger, requirements_id: &str) -> usize {
    ledger
        .posted_readings()
        .iter()
        .filter(|r| r.requirements_id == requirements_id)
        .count()
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(Duration::from_secs(30), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Boots a device with two temperature sensors and starts operating
async fn boot(ledger: Arc<MemoryLedger>) -> (Arc<Device>, JoinHandle<anyhow::Result<()>>) {
    let mut config = AgentConfig::default();
    config.device.id = DEVICE_ID.to_string();

    let device = Device::new(config, ledger.clone());
    device
        .register_static_sensors(vec![
            Arc::new(
                StaticSensorMock::new("HDC1080")
                    .with_value("temperature", 20.0)
                    .with_value("humidity", 40.0),
            ) as Arc<dyn Sensor>,
            Arc::new(StaticSensorMock::new("BMP280").with_value("temperature", 22.0)) as Arc<dyn Sensor>,
        ])
        .await;

    device.init().await.unwrap();

    let operating = {
        let device = Arc::clone(&device);
        tokio::spawn(async move { device.operate().await })
    };

    wait_until(|| device.state() == DeviceState::Operating).await;
    wait_until(|| ledger.subscribe_calls(Topic::Requirements) == 1).await;
    wait_until(|| ledger.subscribe_calls(Topic::Assets) == 1).await;

    (device, operating)
}

#[tokio::test(start_paused = true)]
async fn test_one_shot_requirement_posts_averaged_reading() {
    let ledger = Arc::new(MemoryLedger::new());
    ledger.put_device(device_model());
    let (device, operating) = boot(ledger.clone()).await;

    ledger.put_asset(asset("pallet-1", 52.52, 13.4051));
    wait_until(|| device.assets().exists("pallet-1")).await;

    ledger.put_requirements(requirements("r1", "pallet-1", &["temperature", "humidity"], 0));
    wait_until(|| posted_for(&ledger, "r1") == 1).await;

    let record = ledger
        .posted_readings()
        .into_iter()
        .find(|r| r.requirements_id == "r1")
        .unwrap();
    assert_eq!(record.asset_id, "pallet-1");
    assert_eq!(record.device_id, DEVICE_ID);
    assert_eq!(record.values[&Metric::from("temperature")], 21.0);
    assert_eq!(record.values[&Metric::from("humidity")], 40.0);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(posted_for(&ledger, "r1"), 1);
    assert_eq!(device.reader().active_subscriptions(), 0);

    device.close().await;
    operating.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_far_asset_requirements_are_ignored() {
    let ledger = Arc::new(MemoryLedger::new());
    ledger.put_device(device_model());
    let (device, operating) = boot(ledger.clone()).await;

    ledger.put_asset(asset("far-away", 48.85, 2.35));
    ledger.put_requirements(requirements("r-far", "far-away", &["temperature"], 5));

    tokio::time::sleep(Duration::from_secs(30)).await;

    assert!(!device.assets().exists("far-away"));
    assert!(!device.requirements().exists("r-far"));
    assert_eq!(posted_for(&ledger, "r-far"), 0);

    device.close().await;
    operating.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_requirement_lifecycle_never_leaks_subscriptions() {
    let ledger = Arc::new(MemoryLedger::new());
    ledger.put_device(device_model());
    let (device, operating) = boot(ledger.clone()).await;

    ledger.put_asset(asset("pallet-1", 52.52, 13.405));
    wait_until(|| device.assets().exists("pallet-1")).await;

    ledger.put_requirements(requirements("r1", "pallet-1", &["temperature"], 5));
    wait_until(|| posted_for(&ledger, "r1") == 2).await;

    ledger.put_requirements(requirements("r1", "pallet-1", &["temperature"], 10));
    wait_until(|| {
        device
            .requirements()
            .get("r1")
            .map(|r| r.period == Duration::from_secs(10))
            .unwrap_or(false)
    })
    .await;
    assert_eq!(device.reader().active_subscriptions(), 1);

    ledger.remove_requirements("r1");
    wait_until(|| !device.requirements().exists("r1")).await;
    let posted = posted_for(&ledger, "r1");

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(posted_for(&ledger, "r1"), posted);
    assert_eq!(device.reader().active_subscriptions(), 0);

    device.close().await;
    operating.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_startup_replays_ledger_state() {
    let ledger = Arc::new(MemoryLedger::new());
    ledger.put_device(device_model());
    ledger.put_asset(asset("pallet-1", 52.52, 13.405));
    ledger.put_requirements(requirements("r1", "pallet-1", &["temperature"], 5));

    let (device, operating) = boot(ledger.clone()).await;

    assert_eq!(device.reader().active_subscriptions(), 1);
    wait_until(|| posted_for(&ledger, "r1") >= 1).await;

    let updates = ledger.device_updates();
    assert_eq!(updates.last().unwrap().0, DEVICE_ID);

    device.close().await;
    operating.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_device_removal_shuts_agent_down() {
    let ledger = Arc::new(MemoryLedger::new());
    ledger.put_device(device_model());
    let (device, operating) = boot(ledger.clone()).await;

    let mut events = device.bus().subscribe();
    ledger.remove_device(DEVICE_ID);

    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.kind(), DomainEventKind::DeviceRemovedFromNetwork);

    wait_until(|| device.state() == DeviceState::Closed).await;
    operating.await.unwrap().unwrap();

    assert!(!device.is_logged_to_network());
}
