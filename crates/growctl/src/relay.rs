//! Relay board driving the chamber outputs. The `gpio` feature gates the
//! real rppal driver; without it, a mock board only logs state changes.

use anyhow::{anyhow, bail, Result};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use tracing::{info, warn};

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};

use crate::events::{AuditEvent, EventLog};
use crate::hardware::{Actuators, Device};

/// One relay output. `on` is the last level actually written.
struct Channel {
    #[cfg(feature = "gpio")]
    pin: OutputPin,
    gpio: u8,
    on: bool,
}

impl Channel {
    #[cfg(feature = "gpio")]
    fn write(&mut self, on: bool, active_low: bool) {
        // active-low: LOW = ON, HIGH = OFF
        if on != active_low {
            self.pin.set_high();
        } else {
            self.pin.set_low();
        }
    }

    #[cfg(not(feature = "gpio"))]
    fn write(&mut self, _on: bool, _active_low: bool) {}
}

/// Lock-per-device relay board. Every channel is OFF after construction.
pub struct RelayBoard {
    channels: BTreeMap<Device, Mutex<Channel>>,
    active_low: bool,
    events: EventLog,
}

impl RelayBoard {
    #[cfg(feature = "gpio")]
    pub fn new(pins: &[(Device, i64)], active_low: bool, events: EventLog) -> Result<Self> {
        let gpio = Gpio::new()?;
        let mut channels = BTreeMap::new();
        for &(device, pin_num) in pins {
            let bcm = u8::try_from(pin_num).map_err(|_| anyhow!("{device}: bad pin {pin_num}"))?;
            let pin = gpio.get(bcm)?.into_output();
            let mut channel = Channel {
                pin,
                gpio: bcm,
                on: false,
            };
            channel.write(false, active_low);
            info!(%device, gpio = bcm, "relay registered");
            channels.insert(device, Mutex::new(channel));
        }
        Ok(Self {
            channels,
            active_low,
            events,
        })
    }

    #[cfg(not(feature = "gpio"))]
    pub fn new(pins: &[(Device, i64)], active_low: bool, events: EventLog) -> Result<Self> {
        let mut channels = BTreeMap::new();
        for &(device, pin_num) in pins {
            let bcm = u8::try_from(pin_num).map_err(|_| anyhow!("{device}: bad pin {pin_num}"))?;
            info!(%device, gpio = bcm, "[mock-gpio] relay registered (not wired)");
            channels.insert(
                device,
                Mutex::new(Channel {
                    gpio: bcm,
                    on: false,
                }),
            );
        }
        info!("[mock-gpio] relay board initialised (no hardware)");
        Ok(Self {
            channels,
            active_low,
            events,
        })
    }

    fn channel(&self, device: Device) -> Result<MutexGuard<'_, Channel>> {
        let Some(slot) = self.channels.get(&device) else {
            bail!("no relay configured for {device}");
        };
        // A poisoned lock still holds a valid level.
        Ok(slot.lock().unwrap_or_else(|p| p.into_inner()))
    }
}

impl Actuators for RelayBoard {
    fn set(&self, device: Device, on: bool) -> Result<()> {
        let mut channel = self.channel(device)?;
        if channel.on == on {
            return Ok(());
        }
        channel.write(on, self.active_low);
        channel.on = on;
        let gpio = channel.gpio;
        drop(channel);

        let level = if on { "ON" } else { "OFF" };
        info!(%device, gpio, on, "relay set");
        self.events.log(
            AuditEvent::new("actuator", format!("{device} {level}"))
                .reason(format!("{device}:{}", if on { "on" } else { "off" }))
                .actor("relay")
                .payload(json!({ "device": device, "gpio": gpio, "on": on })),
        );
        Ok(())
    }

    fn is_on(&self, device: Device) -> bool {
        match self.channel(device) {
            Ok(channel) => channel.on,
            Err(e) => {
                warn!("{e:#}");
                false
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(all(test, not(feature = "gpio")))]
mod tests {
    use super::*;
    use crate::config::RelayConfig;

    fn board() -> (RelayBoard, EventLog) {
        let events = EventLog::new();
        let board = RelayBoard::new(&RelayConfig::default().pins(), true, events.clone()).unwrap();
        (board, events)
    }

    #[test]
    fn new_registers_every_device_off() {
        let (board, _) = board();
        assert_eq!(board.channels.len(), Device::ALL.len());
        for d in Device::ALL {
            assert!(!board.is_on(d), "{d}");
        }
    }

    #[test]
    fn set_on_records_actuator_event() {
        let (board, events) = board();
        board.set(Device::MainPump, true).unwrap();
        assert!(board.is_on(Device::MainPump));

        let logged = events.pending();
        assert_eq!(logged.len(), 1);
        assert_eq!(logged[0].kind, "actuator");
        assert_eq!(logged[0].reason_code.as_deref(), Some("main_pump:on"));
    }

    #[test]
    fn repeated_command_is_a_no_op() {
        let (board, events) = board();
        board.set(Device::Fan, true).unwrap();
        board.set(Device::Fan, true).unwrap();
        board.set(Device::Heater, false).unwrap();
        assert_eq!(events.pending().len(), 1);
    }

    #[test]
    fn all_off_resets_everything() {
        let (board, _) = board();
        board.set(Device::Fan, true).unwrap();
        board.set(Device::NutrientB, true).unwrap();
        board.all_off();
        for d in Device::ALL {
            assert!(!board.is_on(d));
        }
    }

    #[test]
    fn unconfigured_device_is_an_error() {
        let events = EventLog::new();
        let board = RelayBoard::new(&[(Device::Fan, 22)], false, events).unwrap();
        assert!(board.set(Device::MainPump, true).is_err());
        assert!(!board.is_on(Device::MainPump));
    }

    #[test]
    fn out_of_range_pin_is_rejected() {
        assert!(RelayBoard::new(&[(Device::Fan, -1)], true, EventLog::new()).is_err());
    }
}
