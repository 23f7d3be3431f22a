mod pwm;
mod relay;
mod sensor;
mod tracker;

pub use pwm::Dimmer;
pub use relay::{Relay, DEFAULT_IP_CHECK_PULSE_MS};
pub use sensor::{PressKind, Sensor};
pub use tracker::Tracker;

const ACTION_STATE: &str = "state";

fn on_off(on: bool) -> &'static str {
    crate::types::SwitchState::from_bool(on).as_str()
}
