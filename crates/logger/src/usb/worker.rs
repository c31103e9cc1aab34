//! Poll worker
//!
//! Dedicated thread that drives every attached logger. Each cycle services
//! the devices one after another:
//!
//! 1. Clock sync when the last one is older than the sync interval
//! 2. Flash erase when the last one is older than the erase interval
//! 3. Poll requests until the logger answers "no new data", publishing every
//!    decoded point to the registered listeners
//!
//! Between cycles the worker sleeps for the poll interval and, at most once
//! per device-check interval, re-enumerates the bus. The worker runs while at
//! least one listener is registered and returns once the set is empty.

use crate::usb::manager::{DeviceManager, ManagedDevice, Transport, UsbBackend};
use crate::usb::transfers::DEFAULT_TIMEOUT;
use common::{ListenerSet, Result, SensorRegistry};
use protocol::{Command, Response, decode_response};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, warn};

/// Timing policy of the poll loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollSettings {
    /// Sleep between cycles
    pub poll_interval: Duration,
    /// Minimum seconds between bus re-enumerations
    pub device_check_interval: u64,
    /// Seconds between clock syncs
    pub time_sync_interval: u64,
    /// Seconds between flash erases
    pub flash_erase_interval: u64,
    /// Timeout of each bulk transfer
    pub timeout: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(4),
            device_check_interval: 60,
            time_sync_interval: 900,
            flash_erase_interval: 86_400,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// Current Unix time in seconds
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// The acquisition loop and everything it owns
pub struct Poller<B: UsbBackend> {
    manager: DeviceManager<B>,
    registry: SensorRegistry,
    listeners: ListenerSet,
    settings: PollSettings,
    discovered: bool,
}

impl<B: UsbBackend> Poller<B> {
    pub fn new(
        manager: DeviceManager<B>,
        registry: SensorRegistry,
        listeners: ListenerSet,
        settings: PollSettings,
    ) -> Self {
        Self {
            manager,
            registry,
            listeners,
            settings,
            discovered: false,
        }
    }

    pub fn manager(&self) -> &DeviceManager<B> {
        &self.manager
    }

    pub fn registry(&self) -> &SensorRegistry {
        &self.registry
    }

    /// Run until the listener set is empty. Returns the number of cycles.
    pub fn run(&mut self) -> usize {
        if self.listeners.is_empty() {
            info!("No listeners registered, not polling");
            return 0;
        }

        info!("Poll worker started");
        if !self.discovered {
            self.refresh_devices(unix_now());
        }

        let mut cycles = 0;
        while !self.listeners.is_empty() {
            self.cycle(unix_now());
            cycles += 1;

            debug!("Sleeping {:?}", self.settings.poll_interval);
            std::thread::sleep(self.settings.poll_interval);

            self.check_devices(unix_now());
        }

        info!("Last listener unregistered, poll worker stopped after {} cycles", cycles);
        cycles
    }

    /// Enumerate the bus, replace the device set and initialize every device
    pub fn refresh_devices(&mut self, now: u64) {
        self.discovered = true;
        if let Err(e) = self.manager.discover(now) {
            error!("Device discovery failed: {}", e);
            return;
        }

        self.manager.initialize_all();

        let timeout = self.settings.timeout;
        for device in self.manager.devices_mut() {
            sync_clock(device, now, timeout);
        }
    }

    /// Re-enumerate when the check interval elapsed and the device count changed
    pub fn check_devices(&mut self, now: u64) -> bool {
        let due = self
            .manager
            .last_device_check()
            .saturating_add(self.settings.device_check_interval);
        if now <= due {
            return false;
        }

        debug!("Checking for new devices");
        if !self.manager.needs_rediscovery(now) {
            return false;
        }
        self.refresh_devices(now);
        true
    }

    /// Service every device once, then drop devices with too many errors
    pub fn cycle(&mut self, now: u64) {
        let Self {
            manager,
            registry,
            listeners,
            settings,
            ..
        } = self;
        let max_errors = manager.max_errors();

        for device in manager.devices_mut() {
            debug!("Polling device at {}", device.location());

            if now.saturating_sub(device.last_time_sync) > settings.time_sync_interval {
                sync_clock(device, now, settings.timeout);
            }

            if now.saturating_sub(device.last_flash_erase) > settings.flash_erase_interval {
                erase_flash(device, now, settings.timeout);
            }

            drain(device, registry, listeners, now, settings.timeout, max_errors);
        }

        manager.remove_failed();
    }
}

/// Set the device clock; failures are logged and retried next cycle
fn sync_clock<T: Transport>(device: &mut ManagedDevice<T>, now: u64, timeout: Duration) {
    debug!("Setting time for USB device at {}", device.location());
    let request = Command::SetClock { unix_time: now }.encode();

    match device.exchange(&request, timeout) {
        Ok(_) => device.last_time_sync = now,
        Err(e) => error!("Error setting time on {}: {}", device.location(), e),
    }
}

/// Erase the internal flash; failures are logged and retried next cycle
fn erase_flash<T: Transport>(device: &mut ManagedDevice<T>, now: u64, timeout: Duration) {
    debug!("Deleting internal flash data of USB device at {}", device.location());
    let request = Command::EraseFlash.encode();

    match device.exchange(&request, timeout) {
        Ok(_) => device.last_flash_erase = now,
        Err(e) => error!("Error deleting flash on {}: {}", device.location(), e),
    }
}

/// Poll until the device has nothing buffered or a transfer fails
fn drain<T: Transport>(
    device: &mut ManagedDevice<T>,
    registry: &mut SensorRegistry,
    listeners: &ListenerSet,
    now: u64,
    timeout: Duration,
    max_errors: u32,
) {
    let request = Command::Poll.encode();

    loop {
        let result: Result<Response> = device
            .exchange(&request, timeout)
            .and_then(|frame| decode_response(&frame).map_err(Into::into));

        match result {
            Ok(Response::NoData) => break,
            Ok(Response::Records(records)) => {
                device.last_data_read = now;
                for point in registry.data_points(&records) {
                    listeners.publish(Arc::new(point));
                }
                device.record_success();
            }
            Err(e) => {
                info!("Unable to read new data from {}: {}", device.location(), e);
                let errors = device.record_error();
                if errors > max_errors {
                    warn!(
                        "Device at {} exceeded {} consecutive errors",
                        device.location(),
                        max_errors
                    );
                }
                break;
            }
        }
    }
}

/// Spawn the poll worker thread
///
/// The thread runs [`Poller::run`] and yields the number of completed cycles.
pub fn spawn_poll_worker<B>(mut poller: Poller<B>) -> std::io::Result<JoinHandle<usize>>
where
    B: UsbBackend + 'static,
{
    std::thread::Builder::new()
        .name("poll-worker".to_string())
        .spawn(move || poller.run())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb::fake::{FakeBackend, FakeLogger};
    use crate::usb::manager::DEFAULT_MAX_ERRORS;
    use common::test_utils::{
        FailingListener, FailureMode, RecordingListener, encode_records, long_record,
        short_record,
    };
    use common::{DataListener, DataPoint};
    use protocol::{EPOCH_OFFSET, opcode};

    const NOW: u64 = 1_700_000_000;

    fn settings() -> PollSettings {
        PollSettings {
            poll_interval: Duration::ZERO,
            device_check_interval: u64::MAX / 2,
            ..PollSettings::default()
        }
    }

    fn poller(backend: FakeBackend, listeners: ListenerSet) -> Poller<FakeBackend> {
        Poller::new(
            DeviceManager::new(backend, DEFAULT_MAX_ERRORS),
            SensorRegistry::new(),
            listeners,
            settings(),
        )
    }

    #[test]
    fn test_no_listeners_means_no_transport_activity() {
        let logger = FakeLogger::new("a");
        let backend = FakeBackend::new(vec![logger.clone()]);
        let mut poller = poller(backend.clone(), ListenerSet::new());

        assert_eq!(poller.run(), 0);
        assert_eq!(backend.discover_calls(), 0);
        assert!(logger.sent().is_empty());
    }

    #[test]
    fn test_refresh_initializes_and_syncs_clock() {
        let logger = FakeLogger::new("a");
        let mut poller = poller(FakeBackend::new(vec![logger.clone()]), ListenerSet::new());

        poller.refresh_devices(NOW);

        assert!(logger.is_initialized());
        assert_eq!(logger.sent(), vec![Command::SetClock { unix_time: NOW }]);
        assert_eq!(poller.manager().devices()[0].last_time_sync, NOW);
    }

    #[test]
    fn test_cycle_runs_maintenance_then_drains() {
        let logger = FakeLogger::new("a");
        logger.push_response(encode_records(&[short_record(5, 42, 16)]));
        logger.push_response(encode_records(&[long_record(5, 43, 20, 99)]));

        let listeners = ListenerSet::new();
        let recorder = Arc::new(RecordingListener::new("recorder"));
        listeners.register(recorder.clone());

        let mut poller = poller(FakeBackend::new(vec![logger.clone()]), listeners);
        poller.refresh_devices(NOW);
        poller.cycle(NOW + 1000);

        // clock sync at refresh, again after >900s, erase, three polls
        assert_eq!(
            logger.sent_opcodes(),
            vec![
                opcode::SET_CLOCK,
                opcode::SET_CLOCK,
                opcode::ERASE_FLASH,
                opcode::POLL,
                opcode::POLL,
                opcode::POLL
            ]
        );

        let points = recorder.points();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].raw_value, 42);
        assert_eq!(points[0].timestamp, u64::from(EPOCH_OFFSET) + 16);
        assert_eq!(points[1].signal, Some(99));

        let device = &poller.manager().devices()[0];
        assert_eq!(device.last_data_read, NOW + 1000);
        assert_eq!(device.last_flash_erase, NOW + 1000);
        assert_eq!(device.consecutive_errors, 0);
    }

    #[test]
    fn test_maintenance_respects_intervals() {
        let logger = FakeLogger::new("a");
        let mut poller = poller(FakeBackend::new(vec![logger.clone()]), ListenerSet::new());
        poller.refresh_devices(NOW);
        poller.cycle(NOW);

        // erase is due immediately, clock was just synced
        assert_eq!(
            logger.sent_opcodes(),
            vec![opcode::SET_CLOCK, opcode::ERASE_FLASH, opcode::POLL]
        );

        poller.cycle(NOW + 900);
        assert_eq!(logger.sent_opcodes().len(), 4);

        poller.cycle(NOW + 901);
        assert_eq!(
            &logger.sent_opcodes()[4..],
            &[opcode::SET_CLOCK, opcode::POLL]
        );

        poller.cycle(NOW + 86_401);
        assert_eq!(
            &logger.sent_opcodes()[6..],
            &[opcode::SET_CLOCK, opcode::ERASE_FLASH, opcode::POLL]
        );
    }

    #[test]
    fn test_maintenance_failure_does_not_abort_cycle() {
        let logger = FakeLogger::new("a");
        logger.fail_opcode(opcode::SET_CLOCK);
        logger.fail_opcode(opcode::ERASE_FLASH);
        logger.push_response(encode_records(&[short_record(2, 1, 1)]));

        let listeners = ListenerSet::new();
        let recorder = Arc::new(RecordingListener::new("recorder"));
        listeners.register(recorder.clone());

        let mut poller = poller(FakeBackend::new(vec![logger.clone()]), listeners);
        poller.refresh_devices(NOW);
        poller.cycle(NOW);

        assert_eq!(recorder.count(), 1);
        let device = &poller.manager().devices()[0];
        assert_eq!(device.last_time_sync, 0);
        assert_eq!(device.last_flash_erase, 0);
        assert_eq!(device.consecutive_errors, 0);
    }

    #[test]
    fn test_device_removed_after_eleven_failures() {
        let broken = FakeLogger::new("broken");
        let healthy = FakeLogger::new("healthy");
        broken.fail_all(true);

        let listeners = ListenerSet::new();
        let recorder = Arc::new(RecordingListener::new("recorder"));
        listeners.register(recorder.clone());

        let mut poller = poller(
            FakeBackend::new(vec![broken.clone(), healthy.clone()]),
            listeners,
        );
        poller.refresh_devices(NOW);

        for i in 0..10 {
            healthy.push_response(encode_records(&[short_record(4, i, 0)]));
            poller.cycle(NOW + u64::from(i));
            assert_eq!(poller.manager().len(), 2);
        }
        assert_eq!(poller.manager().devices()[0].consecutive_errors, 10);

        poller.cycle(NOW + 10);
        assert_eq!(poller.manager().len(), 1);
        assert_eq!(poller.manager().devices()[0].location(), "healthy");
        assert_eq!(recorder.count(), 10);
    }

    #[test]
    fn test_success_resets_error_count() {
        let logger = FakeLogger::new("a");
        let mut poller = poller(FakeBackend::new(vec![logger.clone()]), ListenerSet::new());
        poller.refresh_devices(NOW);

        logger.fail_all(true);
        for _ in 0..5 {
            poller.cycle(NOW);
        }
        assert_eq!(poller.manager().devices()[0].consecutive_errors, 5);

        logger.fail_all(false);
        logger.push_response(encode_records(&[short_record(2, 1, 1)]));
        poller.cycle(NOW);
        assert_eq!(poller.manager().devices()[0].consecutive_errors, 0);
    }

    #[test]
    fn test_publish_order_across_devices() {
        let first = FakeLogger::new("first");
        let second = FakeLogger::new("second");
        first.push_response(encode_records(&[short_record(1, 10, 0), short_record(1, 11, 0)]));
        second.push_response(encode_records(&[short_record(3, 30, 0)]));

        let listeners = ListenerSet::new();
        let recorder = Arc::new(RecordingListener::new("recorder"));
        listeners.register(recorder.clone());

        let mut poller = poller(FakeBackend::new(vec![first, second]), listeners);
        poller.refresh_devices(NOW);
        poller.cycle(NOW);

        let raw: Vec<u16> = recorder.points().iter().map(|p| p.raw_value).collect();
        assert_eq!(raw, vec![10, 11, 30]);
    }

    #[test]
    fn test_failing_listener_does_not_stop_delivery() {
        let logger = FakeLogger::new("a");
        logger.push_response(encode_records(&[short_record(2, 1, 1)]));

        let listeners = ListenerSet::new();
        let recorder = Arc::new(RecordingListener::new("recorder"));
        listeners.register(Arc::new(FailingListener::new(FailureMode::Panic)));
        listeners.register(recorder.clone());

        let mut poller = poller(FakeBackend::new(vec![logger.clone()]), listeners);
        poller.refresh_devices(NOW);
        poller.cycle(NOW);

        assert_eq!(recorder.count(), 1);
        assert_eq!(poller.manager().devices()[0].consecutive_errors, 0);
    }

    #[test]
    fn test_unknown_sensor_dropped_when_detection_disabled() {
        let logger = FakeLogger::new("a");
        logger.push_response(encode_records(&[short_record(2, 1, 1), short_record(7, 2, 2)]));

        let listeners = ListenerSet::new();
        let recorder = Arc::new(RecordingListener::new("recorder"));
        listeners.register(recorder.clone());

        let mut registry = SensorRegistry::new();
        registry.set_detect_unknown(false);
        registry.define_model(7, "TSN-50E", "Porch").unwrap();

        let mut poller = Poller::new(
            DeviceManager::new(FakeBackend::new(vec![logger]), DEFAULT_MAX_ERRORS),
            registry,
            listeners,
            settings(),
        );
        poller.refresh_devices(NOW);
        poller.cycle(NOW);

        let points = recorder.points();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].sensor.name(), "Porch");
        assert!(!poller.registry().contains(2));
    }

    #[test]
    fn test_rediscovery_on_count_change() {
        let first = FakeLogger::new("first");
        let backend = FakeBackend::new(vec![first.clone()]);
        let mut poller = Poller::new(
            DeviceManager::new(backend.clone(), DEFAULT_MAX_ERRORS),
            SensorRegistry::new(),
            ListenerSet::new(),
            PollSettings::default(),
        );
        poller.refresh_devices(NOW);
        assert_eq!(backend.discover_calls(), 1);

        // within the interval nothing is checked
        backend.set_loggers(vec![first.clone(), FakeLogger::new("second")]);
        assert!(!poller.check_devices(NOW + 60));
        assert_eq!(poller.manager().len(), 1);

        assert!(poller.check_devices(NOW + 61));
        assert_eq!(backend.discover_calls(), 2);
        assert_eq!(poller.manager().len(), 2);

        // unchanged count keeps the existing set
        assert!(!poller.check_devices(NOW + 200));
        assert_eq!(backend.discover_calls(), 2);
    }

    #[test]
    fn test_failed_initialization_drops_device() {
        let bad = FakeLogger::new("bad").failing_init();
        let good = FakeLogger::new("good");
        let mut poller = poller(FakeBackend::new(vec![bad.clone(), good]), ListenerSet::new());

        poller.refresh_devices(NOW);

        assert_eq!(poller.manager().len(), 1);
        assert_eq!(bad.resets(), 1);
        assert!(bad.sent().is_empty());
    }

    /// Clears the whole listener set after a number of points
    struct StopAfter {
        listeners: ListenerSet,
        remaining: std::sync::Mutex<usize>,
    }

    impl DataListener for StopAfter {
        fn name(&self) -> &str {
            "stop-after"
        }

        fn on_new_data(&self, _point: Arc<DataPoint>) -> anyhow::Result<()> {
            let mut remaining = self.remaining.lock().unwrap();
            *remaining = remaining.saturating_sub(1);
            if *remaining == 0 {
                self.listeners.clear();
            }
            Ok(())
        }
    }

    #[test]
    fn test_run_stops_when_listeners_leave() {
        let logger = FakeLogger::new("a");
        logger.push_response(encode_records(&[short_record(2, 1, 1)]));
        logger.push_response(encode_records(&[short_record(2, 2, 2)]));

        let listeners = ListenerSet::new();
        listeners.register(Arc::new(StopAfter {
            listeners: listeners.clone(),
            remaining: std::sync::Mutex::new(2),
        }));

        let backend = FakeBackend::new(vec![logger.clone()]);
        let mut poller = poller(backend.clone(), listeners.clone());

        assert_eq!(poller.run(), 1);
        assert!(listeners.is_empty());
        assert_eq!(backend.discover_calls(), 1);
        assert!(logger.sent_opcodes().contains(&opcode::POLL));
    }

    #[test]
    fn test_spawned_worker_stops_on_clear() {
        let logger = FakeLogger::new("a");
        let listeners = ListenerSet::new();
        listeners.register(Arc::new(RecordingListener::new("recorder")));

        let mut poller = poller(FakeBackend::new(vec![logger]), listeners.clone());
        poller.settings.poll_interval = Duration::from_millis(5);

        let handle = spawn_poll_worker(poller).unwrap();
        std::thread::sleep(Duration::from_millis(30));
        listeners.clear();

        let cycles = handle.join().unwrap();
        assert!(cycles >= 1);
    }
}
