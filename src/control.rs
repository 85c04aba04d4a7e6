//! SoC-driven support control for the inverter
//!
//! A two-state hysteresis over the battery's mean state of charge decides
//! whether the inverter's support register should be enabled. The device is
//! only written when it disagrees with the decision.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{ControlConfig, SupportRegister};
use crate::devices::xw;
use crate::error::{ConfigError, IoError};
use crate::modbus::codec::{self, EncodeError, EnumValue, RegisterValue};
use crate::modbus::{read_field, FieldError, RegisterDevice, RegisterField};

impl SupportRegister {
    pub fn field(self) -> RegisterField {
        match self {
            SupportRegister::GridSupport => xw::GRID_SUPPORT_STATUS,
            SupportRegister::LoadShave => xw::LOAD_SHAVE_STATUS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupportState {
    Disabled,
    Enabled,
}

impl SupportState {
    fn code(self) -> u16 {
        match self {
            SupportState::Disabled => 0,
            SupportState::Enabled => 1,
        }
    }

    fn from_code(code: u16) -> Option<Self> {
        match code {
            0 => Some(SupportState::Disabled),
            1 => Some(SupportState::Enabled),
            _ => None,
        }
    }
}

impl std::fmt::Display for SupportState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SupportState::Disabled => f.write_str("OFF"),
            SupportState::Enabled => f.write_str("ON"),
        }
    }
}

/// Last decided support state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControlState {
    pub support: SupportState,
    pub last_transition_at: Option<DateTime<Utc>>,
}

/// SoC band inside which the support state is held
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Hysteresis {
    low: u8,
    high: u8,
}

impl Hysteresis {
    pub fn new(low: u8, high: u8) -> Result<Self, ConfigError> {
        if high > 100 {
            return Err(ConfigError::ThresholdRange(high));
        }
        if low >= high {
            return Err(ConfigError::ThresholdOrder { low, high });
        }
        Ok(Self { low, high })
    }

    /// State demanded by `mean_soc`, or `None` inside the band
    pub fn target(&self, mean_soc: f64) -> Option<SupportState> {
        if mean_soc >= self.high as f64 {
            Some(SupportState::Enabled)
        } else if mean_soc <= self.low as f64 {
            Some(SupportState::Disabled)
        } else {
            None
        }
    }

    pub fn next(&self, current: SupportState, mean_soc: f64) -> SupportState {
        self.target(mean_soc).unwrap_or(current)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("read {0}")]
    Read(#[from] FieldError),
    #[error("write {field}: {source}")]
    Write {
        field: &'static str,
        #[source]
        source: IoError,
    },
    #[error("encode {field}: {source}")]
    Encode {
        field: &'static str,
        #[source]
        source: EncodeError,
    },
    #[error("{field} reported unexpected code {code}")]
    UnexpectedStatus { field: &'static str, code: u16 },
}

/// Result of one policy pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlOutcome {
    pub state: SupportState,
    pub transitioned: bool,
    pub writes: usize,
}

pub struct ControlPolicy {
    hysteresis: Hysteresis,
    register: RegisterField,
    state: ControlState,
    cutout: f64,
    cutout_hysteresis: f64,
    safe_cutout: f64,
    safe_hysteresis: f64,
}

impl ControlPolicy {
    pub fn new(config: &ControlConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            hysteresis: Hysteresis::new(config.soc_low, config.soc_high)?,
            register: config.support_register.field(),
            state: ControlState {
                support: SupportState::Disabled,
                last_transition_at: None,
            },
            cutout: config.battery_low_cutout,
            cutout_hysteresis: config.battery_hysteresis,
            safe_cutout: config.safe_cutout,
            safe_hysteresis: config.safe_hysteresis,
        })
    }

    pub fn state(&self) -> &ControlState {
        &self.state
    }

    /// Write the operating cutout and hysteresis, then adopt the device's
    /// current support state. Runs once before the first tick.
    pub async fn initialise(&mut self, inverter: &mut dyn RegisterDevice) -> Result<(), ControlError> {
        self.apply_battery_limits(inverter).await?;
        self.state.support = self.read_support(inverter).await?;
        info!("{} initially {}", self.register.name, self.state.support);
        Ok(())
    }

    /// Write the operating low-battery cut-out and its hysteresis
    pub async fn apply_battery_limits(
        &mut self,
        inverter: &mut dyn RegisterDevice,
    ) -> Result<(), ControlError> {
        write_field(
            inverter,
            &xw::LOW_BATTERY_CUT_OUT,
            RegisterValue::Number(self.cutout),
        )
        .await?;
        write_field(
            inverter,
            &xw::BATTERY_HYSTERESIS,
            RegisterValue::Number(self.cutout_hysteresis),
        )
        .await?;
        info!(
            "Battery low cut-out {} V, hysteresis {} V",
            self.cutout, self.cutout_hysteresis
        );
        Ok(())
    }

    /// One policy pass against this tick's mean SoC
    pub async fn apply(
        &mut self,
        inverter: &mut dyn RegisterDevice,
        mean_soc: f64,
    ) -> Result<ControlOutcome, ControlError> {
        let Some(desired) = self.hysteresis.target(mean_soc) else {
            debug!("SoC {:.1} inside band, holding {}", mean_soc, self.state.support);
            return Ok(ControlOutcome {
                state: self.state.support,
                transitioned: false,
                writes: 0,
            });
        };

        let actual = self.read_support(inverter).await?;
        let mut writes = 0;
        if actual != desired {
            self.write_support(inverter, desired).await?;
            writes += 1;
        }

        let transitioned = self.state.support != desired;
        if transitioned {
            self.state.last_transition_at = Some(Utc::now());
            info!(
                "Support {} at SoC {:.1} ({})",
                desired, mean_soc, self.register.name
            );
        }
        self.state.support = desired;

        Ok(ControlOutcome {
            state: desired,
            transitioned,
            writes,
        })
    }

    /// Put the inverter back into its safe configuration. Every write is
    /// attempted even if an earlier one fails; the first error is returned.
    pub async fn restore_safe_defaults(
        &mut self,
        inverter: &mut dyn RegisterDevice,
    ) -> Result<(), ControlError> {
        let results = [
            write_field(
                inverter,
                &xw::BATTERY_HYSTERESIS,
                RegisterValue::Number(self.safe_hysteresis),
            )
            .await,
            write_field(
                inverter,
                &xw::LOW_BATTERY_CUT_OUT,
                RegisterValue::Number(self.safe_cutout),
            )
            .await,
            self.write_support(inverter, SupportState::Disabled).await,
        ];

        if self.state.support != SupportState::Disabled {
            self.state.last_transition_at = Some(Utc::now());
        }
        self.state.support = SupportState::Disabled;

        let mut first = None;
        for result in results {
            if let Err(e) = result {
                warn!("Safe default restore: {}", e);
                first.get_or_insert(e);
            }
        }
        match first {
            Some(e) => Err(e),
            None => {
                info!(
                    "Restored safe defaults: cut-out {} V, hysteresis {} V, support OFF",
                    self.safe_cutout, self.safe_hysteresis
                );
                Ok(())
            }
        }
    }

    async fn read_support(
        &self,
        inverter: &mut dyn RegisterDevice,
    ) -> Result<SupportState, ControlError> {
        let value = read_field(inverter, &self.register).await?;
        let code = match value.as_enum() {
            Some(e) => e.code,
            None => u16::MAX,
        };
        SupportState::from_code(code).ok_or(ControlError::UnexpectedStatus {
            field: self.register.name,
            code,
        })
    }

    async fn write_support(
        &self,
        inverter: &mut dyn RegisterDevice,
        state: SupportState,
    ) -> Result<(), ControlError> {
        let value = RegisterValue::Enum(EnumValue {
            code: state.code(),
            label: None,
        });
        write_field(inverter, &self.register, value).await
    }
}

async fn write_field(
    inverter: &mut dyn RegisterDevice,
    field: &RegisterField,
    value: RegisterValue,
) -> Result<(), ControlError> {
    let words = codec::encode(&value, &field.descriptor).map_err(|source| ControlError::Encode {
        field: field.name,
        source,
    })?;
    inverter
        .write_registers(field.address, &words)
        .await
        .map_err(|source| ControlError::Write {
            field: field.name,
            source,
        })
}
