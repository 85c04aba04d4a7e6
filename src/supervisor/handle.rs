//! Device handles and per-device retry accounting

use std::time::Duration;

use crate::config::{BatteryConfig, ModbusDeviceConfig, RetryConfig};
use crate::console::{ConsoleBatteryClient, ConsoleTransport};
use crate::devices::DeviceKind;
use crate::modbus::RegisterDevice;

/// What the supervisor should do after a failed poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    Continue,
    Reconnect,
    Abort,
}

/// Failure thresholds for one device. A threshold is exceeded once the
/// consecutive failure count is strictly greater than it.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub reconnect_after: u32,
    pub abort_after: u32,
    pub cooldown: Duration,
}

impl RetryPolicy {
    pub fn action(&self, failures: u32) -> RetryAction {
        if failures > self.abort_after {
            RetryAction::Abort
        } else if failures > self.reconnect_after {
            RetryAction::Reconnect
        } else {
            RetryAction::Continue
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            reconnect_after: config.reconnect_after,
            abort_after: config.abort_after,
            cooldown: Duration::from_millis(config.cooldown_ms),
        }
    }
}

/// Consecutive failures since the last successful poll
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryState {
    failures: u32,
}

impl RetryState {
    pub fn count(&self) -> u32 {
        self.failures
    }

    pub fn record_failure(&mut self) -> u32 {
        self.failures = self.failures.saturating_add(1);
        self.failures
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }
}

/// Startup liveness budget
#[derive(Debug, Clone, PartialEq)]
pub struct StartupProbe {
    pub attempts: u32,
    pub interval: Duration,
    /// Failed attempt after which the handshake is forced once more
    pub rehandshake_after: Option<u32>,
}

/// One Modbus device owned by the supervisor
pub struct DeviceHandle {
    pub id: String,
    pub kind: DeviceKind,
    pub device: Box<dyn RegisterDevice>,
    pub retry: RetryState,
    pub policy: RetryPolicy,
    pub startup: StartupProbe,
}

impl DeviceHandle {
    pub fn new(config: &ModbusDeviceConfig, kind: DeviceKind, device: Box<dyn RegisterDevice>) -> Self {
        Self {
            id: config.id.clone(),
            kind,
            device,
            retry: RetryState::default(),
            policy: RetryPolicy::from(&config.retry),
            startup: StartupProbe {
                attempts: 3,
                interval: Duration::from_millis(config.settle_delay_ms),
                rehandshake_after: None,
            },
        }
    }
}

/// The battery console link owned by the supervisor
pub struct BatteryHandle {
    pub client: ConsoleBatteryClient,
    pub module_count: usize,
    pub retry: RetryState,
    pub policy: RetryPolicy,
    pub startup: StartupProbe,
}

impl BatteryHandle {
    pub fn new(config: &BatteryConfig, transport: Box<dyn ConsoleTransport>) -> Self {
        Self {
            client: ConsoleBatteryClient::new(config.id.clone(), transport, config.timing()),
            module_count: config.module_count,
            retry: RetryState::default(),
            policy: RetryPolicy::from(&config.retry),
            startup: StartupProbe {
                attempts: config.startup_probes,
                interval: Duration::from_millis(config.probe_interval_ms),
                rehandshake_after: Some(config.rehandshake_after),
            },
        }
    }

    pub fn id(&self) -> &str {
        self.client.device_id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            reconnect_after: 3,
            abort_after: 10,
            cooldown: Duration::ZERO,
        }
    }

    #[test]
    fn test_thresholds_are_exceeded_strictly() {
        let p = policy();
        assert_eq!(p.action(1), RetryAction::Continue);
        assert_eq!(p.action(3), RetryAction::Continue);
        assert_eq!(p.action(4), RetryAction::Reconnect);
        assert_eq!(p.action(10), RetryAction::Reconnect);
        assert_eq!(p.action(11), RetryAction::Abort);
    }

    #[test]
    fn test_retry_state_counts_and_resets() {
        let mut state = RetryState::default();
        assert_eq!(state.record_failure(), 1);
        assert_eq!(state.record_failure(), 2);
        state.reset();
        assert_eq!(state.count(), 0);
    }

    #[test]
    fn test_policy_from_config() {
        let p = RetryPolicy::from(&RetryConfig::default());
        assert_eq!(p.reconnect_after, 3);
        assert_eq!(p.abort_after, 10);
        assert_eq!(p.cooldown, Duration::from_secs(5));
    }
}
