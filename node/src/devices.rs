use std::sync::Arc;

use anyhow::{anyhow, Context};
use log::info;
use mpp_common::{
    config::{DeviceConfig, DeviceKind},
    Device, Dimmer, EdgeCounter, InputPin, OutputPin, PwmOutput, Relay, Sensor, Tracker,
};

/// Pin drivers of one runtime.
pub trait PinBank {
    /// `edges` must be recorded on every level change of the pin.
    fn input(
        &mut self,
        pin: u8,
        pullup: bool,
        edges: Arc<EdgeCounter>,
    ) -> anyhow::Result<Box<dyn InputPin>>;
    fn output(&mut self, pin: u8) -> anyhow::Result<Box<dyn OutputPin>>;
    fn pwm(&mut self, pin: u8) -> anyhow::Result<Box<dyn PwmOutput>>;
}

pub fn build_device(config: &DeviceConfig, pins: &mut dyn PinBank) -> anyhow::Result<Device> {
    let device_type = config.kind.device_type();
    let device = match config.kind {
        DeviceKind::Sensor => {
            let pin = required_pin(config)?;
            let edges = EdgeCounter::new();
            let input = pins
                .input(pin, config.pullup, Arc::clone(&edges))
                .with_context(|| format!("sensor input on GPIO{pin}"))?;
            let mut sensor = Sensor::new(input, edges, config.invert);
            if let Some(follower) = config.follower_pin {
                sensor = sensor.with_follower(
                    pins.output(follower)
                        .with_context(|| format!("sensor follower on GPIO{follower}"))?,
                );
            }
            if let Some(active_level) = config.long_press {
                sensor = sensor.with_long_press(active_level);
            }
            Device::new(device_type, sensor)
        }
        DeviceKind::Relay => {
            let pin = required_pin(config)?;
            let output = pins
                .output(pin)
                .with_context(|| format!("relay output on GPIO{pin}"))?;
            let mut relay =
                Relay::new(output, config.pulse_ms, config.base_state).inverted(config.invert);
            if let Some(follower) = config.follower_pin {
                relay = relay.with_follower(
                    pins.output(follower)
                        .with_context(|| format!("relay follower on GPIO{follower}"))?,
                    config.follower_invert,
                );
            }
            Device::new(device_type, relay)
        }
        DeviceKind::Dimmer => {
            let pin = required_pin(config)?;
            let output = pins
                .pwm(pin)
                .with_context(|| format!("dimmer output on GPIO{pin}"))?;
            Device::new(device_type, Dimmer::new(output))
        }
        DeviceKind::Tracker => Device::new(device_type, Tracker::new()),
        DeviceKind::Reporter => Device::passive(device_type),
    };
    info!(
        "Built {} device ({}){}",
        config.kind.as_str(),
        device_type.as_str(),
        config.pin.map(|pin| format!(" on GPIO{pin}")).unwrap_or_default()
    );
    Ok(device)
}

fn required_pin(config: &DeviceConfig) -> anyhow::Result<u8> {
    config
        .pin
        .ok_or_else(|| anyhow!("{} device needs a pin", config.kind.as_str()))
}
