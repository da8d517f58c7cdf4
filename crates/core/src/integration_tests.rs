//! Integration tests: exercise the full flow using simulated HID++ devices.
//!
//! Each test scripts a complete device on a [`MockTransport`], runs discovery
//! and battery polling through a [`LogicalDevice`], and checks what ends up in
//! the event stream and in the snapshot store.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
    use tokio_util::sync::CancellationToken;

    use crate::battery::{BatteryVariant, ChargeState};
    use crate::config::PollSchedule;
    use crate::engine::fixtures::script_device;
    use crate::engine::{self, InitOutcome};
    use crate::hidpp::features;
    use crate::ipc::IpcMessage;
    use crate::logical::{DeviceContext, LogicalDevice};
    use crate::snapshot::DeviceStore;
    use crate::transport::mock::{short_report, MockTransport};

    const DEV_IDX: u8 = 0x02;

    fn context() -> (DeviceContext, UnboundedReceiver<IpcMessage>) {
        let (events, rx) = unbounded_channel();
        let idle = Duration::from_secs(3600);
        (
            DeviceContext {
                disabled_devices: Arc::new(Vec::new()),
                schedule: PollSchedule {
                    settle: idle,
                    poll_period: idle,
                    retry_interval: idle,
                },
                events,
            },
            rx,
        )
    }

    fn drain(rx: &mut UnboundedReceiver<IpcMessage>) -> Vec<IpcMessage> {
        let mut out = Vec::new();
        while let Ok(message) = rx.try_recv() {
            out.push(message);
        }
        out
    }

    /// Test: receiver-paired mouse with unified battery, identified by unit and model id.
    #[test]
    fn full_discovery_with_unified_battery() {
        let mock = MockTransport::new();
        let map = script_device(
            &mock,
            DEV_IDX,
            "MX Master 3",
            &[features::DEVICE_INFO, features::DEVICE_NAME, features::UNIFIED_BATTERY],
        );
        let battery_idx = map[&features::UNIFIED_BATTERY];
        // No state of charge, level "good", charging.
        mock.on_short_request(DEV_IDX, battery_idx, 0x11, &[], &[0x00, 0x04, 0x01]);

        let InitOutcome::Ready(profile) = engine::discover(&mock, DEV_IDX, &[]).unwrap() else {
            panic!("device should be ready");
        };
        assert_eq!(profile.name, "MX Master 3");
        assert_eq!(profile.identifier, "11223344-408A000000");
        assert_eq!(profile.feature_map.len(), 5);
        assert_eq!(
            profile.variant,
            Some(BatteryVariant::Unified {
                feature_index: battery_idx
            })
        );

        let reading = profile.variant.unwrap().read(&mock, DEV_IDX).unwrap();
        assert_eq!(reading.percentage, 50.0);
        assert_eq!(reading.charge_state, ChargeState::Charging);
        assert_eq!(reading.millivolts, -1);
    }

    /// Test: 0x1000 wins over 0x1004 and is the only battery feature ever read.
    #[tokio::test]
    async fn battery_status_takes_priority() {
        let mock = Arc::new(MockTransport::new());
        let map = script_device(
            mock.as_ref(),
            DEV_IDX,
            "G903",
            &[features::DEVICE_NAME, features::UNIFIED_BATTERY, features::BATTERY_STATUS],
        );
        let status_idx = map[&features::BATTERY_STATUS];
        let unified_idx = map[&features::UNIFIED_BATTERY];
        mock.on_short_request(DEV_IDX, status_idx, 0x01, &[], &[75, 0, 0]);
        let (ctx, mut rx) = context();

        let device = LogicalDevice::new(DEV_IDX, mock.clone(), ctx, CancellationToken::new());
        device.init().await;
        device.update_battery(true).await;

        let messages = drain(&mut rx);
        assert_eq!(messages.len(), 2);
        match &messages[1] {
            IpcMessage::Update(update) => {
                assert_eq!(update.percentage, 75.0);
                assert_eq!(update.charge_state, ChargeState::Discharging);
            }
            other => panic!("expected update, got {other:?}"),
        }
        assert!(mock.sent().iter().all(|r| r[2] != unified_idx));

        device.shutdown().await;
    }

    /// Test: voltage-only device flows from discovery into the snapshot store.
    #[tokio::test]
    async fn voltage_device_reaches_snapshot() {
        let mock = Arc::new(MockTransport::new());
        let map = script_device(
            mock.as_ref(),
            DEV_IDX,
            "G Pro Wireless",
            &[features::DEVICE_NAME, features::BATTERY_VOLTAGE],
        );
        // 3922 mV, discharging.
        mock.on_short_request(DEV_IDX, map[&features::BATTERY_VOLTAGE], 0x01, &[], &[0x0F, 0x52, 0x00]);
        let (ctx, mut rx) = context();

        let device = LogicalDevice::new(DEV_IDX, mock, ctx, CancellationToken::new());
        device.init().await;
        device.update_battery(false).await;

        let mut store = DeviceStore::new();
        for message in drain(&mut rx) {
            store.apply(&message);
        }
        let record = store.find("G Pro Wireless").expect("device recorded");
        // No 0x0003: identified by the name hash.
        assert_eq!(record.device_id, engine::name_hash("G Pro Wireless"));
        let xml = record.to_xml();
        assert!(xml.contains("<battery_percent>70.00</battery_percent>"));
        assert!(xml.contains("<battery_voltage>3922.00</battery_voltage>"));
        assert!(xml.contains("<charging>False</charging>"));

        device.shutdown().await;
    }

    /// Test: a device without a battery feature is announced but never polled.
    #[tokio::test]
    async fn device_without_battery_is_announced_only() {
        let mock = Arc::new(MockTransport::new());
        script_device(mock.as_ref(), DEV_IDX, "G915 TKL", &[features::DEVICE_NAME]);
        let (ctx, mut rx) = context();

        let device = LogicalDevice::new(DEV_IDX, mock.clone(), ctx, CancellationToken::new());
        device.init().await;
        let sent_after_init = mock.sent().len();
        device.update_battery(true).await;

        let messages = drain(&mut rx);
        assert_eq!(messages.len(), 1);
        let IpcMessage::Init(init) = &messages[0] else {
            panic!("expected init");
        };
        assert!(!init.has_battery);
        assert_eq!(mock.sent().len(), sent_after_init);

        let mut store = DeviceStore::new();
        store.apply(&messages[0]);
        assert_eq!(store.records()[0].battery_percentage, -1.0);
    }

    /// Test: events survive the JSON line encoding used between processes.
    #[tokio::test]
    async fn events_survive_the_wire_encoding() {
        let mock = Arc::new(MockTransport::new());
        let map = script_device(
            mock.as_ref(),
            DEV_IDX,
            "G305",
            &[features::DEVICE_INFO, features::DEVICE_NAME, features::BATTERY_STATUS],
        );
        mock.on_request(
            short_report(DEV_IDX, map[&features::BATTERY_STATUS], 0x01, &[]),
            short_report(DEV_IDX, map[&features::BATTERY_STATUS], 0x01, &[100, 0, 3]),
        );
        let (ctx, mut rx) = context();

        let device = LogicalDevice::new(DEV_IDX, mock, ctx, CancellationToken::new());
        device.init().await;
        device.update_battery(false).await;

        let messages = drain(&mut rx);
        let mut direct = DeviceStore::new();
        let mut wired = DeviceStore::new();
        for message in &messages {
            direct.apply(message);
            let line = serde_json::to_string(message).unwrap();
            assert!(!line.contains('\n'));
            wired.apply(&serde_json::from_str(&line).unwrap());
        }
        assert_eq!(direct.records(), wired.records());
        assert_eq!(wired.records()[0].power_supply_status, ChargeState::Full);

        device.shutdown().await;
    }
}
