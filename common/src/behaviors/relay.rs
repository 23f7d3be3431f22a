use std::any::Any;

use log::info;

use super::{on_off, ACTION_STATE};
use crate::{
    device::{Behavior, DeviceCore},
    io::OutputPin,
    keys::ATTR_STATE,
    parameters::Parameters,
};

/// Off pulse used by the IP check when the relay has no default pulse.
pub const DEFAULT_IP_CHECK_PULSE_MS: u64 = 10_000;

/// Switched output with momentary pulses and periodic flashing.
///
/// Stored and reported state is always logical; `invert` only applies when driving the pin.
pub struct Relay {
    output: Box<dyn OutputPin>,
    invert: bool,
    pulse_ms: u64,
    base_state: bool,
    follower: Option<(Box<dyn OutputPin>, bool)>,
    expires_at: Option<u64>,
    restore_state: bool,
    flash_period_ms: u64,
    flash_next_at: u64,
    on_change: Option<Box<dyn FnMut(bool)>>,
}

impl Relay {
    /// A non-zero `pulse_ms` makes every change a pulse that returns to `base_state`.
    pub fn new(output: impl OutputPin + 'static, pulse_ms: u64, base_state: bool) -> Self {
        Self {
            output: Box::new(output),
            invert: false,
            pulse_ms,
            base_state,
            follower: None,
            expires_at: None,
            restore_state: false,
            flash_period_ms: 0,
            flash_next_at: 0,
            on_change: None,
        }
    }

    pub fn inverted(mut self, invert: bool) -> Self {
        self.invert = invert;
        self
    }

    pub fn with_follower(mut self, output: impl OutputPin + 'static, invert: bool) -> Self {
        self.follower = Some((Box::new(output), invert));
        self
    }

    pub fn on_change(mut self, callback: impl FnMut(bool) + 'static) -> Self {
        self.on_change = Some(Box::new(callback));
        self
    }

    pub fn is_on(&self) -> bool {
        self.output.is_set_high() != self.invert
    }

    pub fn pulse_ms(&self) -> u64 {
        self.pulse_ms
    }

    pub fn is_flashing(&self) -> bool {
        self.flash_period_ms > 0
    }

    /// Drives the relay. A zero `duration_ms` falls back to the default pulse; when that is
    /// also zero the change is permanent and any pending restore is dropped.
    pub fn set_relay(&mut self, core: &mut DeviceCore, state: bool, duration_ms: u64, now_ms: u64) {
        let duration = if duration_ms == 0 {
            self.pulse_ms
        } else {
            duration_ms
        };
        if duration > 0 {
            self.restore_state = if self.pulse_ms > 0 {
                self.base_state
            } else {
                !state
            };
            self.expires_at = Some(now_ms.saturating_add(duration));
            info!(
                "Relay {} {} for {duration}ms",
                core.udn(),
                on_off(state)
            );
        } else {
            self.expires_at = None;
            info!("Relay {} {}", core.udn(), on_off(state));
        }
        self.write(state);
        self.report(core);
    }

    pub fn toggle(&mut self, core: &mut DeviceCore, duration_ms: u64, now_ms: u64) {
        let state = !self.is_on();
        self.set_relay(core, state, duration_ms, now_ms);
    }

    /// Toggles every `period_ms` until cancelled with a zero period.
    pub fn flash(&mut self, core: &mut DeviceCore, period_ms: u64, now_ms: u64) {
        info!("Relay {} flash period {period_ms}ms", core.udn());
        if period_ms == 0 {
            self.cancel_flashing();
            return;
        }
        self.flash_period_ms = period_ms;
        self.flash_next_at = now_ms.saturating_add(period_ms * 2);
        self.toggle(core, period_ms, now_ms);
    }

    pub fn cancel_flashing(&mut self) {
        self.flash_period_ms = 0;
    }

    fn restore(&mut self, core: &mut DeviceCore) {
        info!("Relay {} restored {}", core.udn(), on_off(self.restore_state));
        self.expires_at = None;
        self.write(self.restore_state);
        self.report(core);
    }

    fn write(&mut self, state: bool) {
        self.output.set_level(state != self.invert);
    }

    fn report(&mut self, core: &mut DeviceCore) {
        let on = self.is_on();
        core.publish(ATTR_STATE, on_off(on));
        if let Some((follower, invert)) = self.follower.as_mut() {
            follower.set_level(on != *invert);
        }
        if let Some(callback) = self.on_change.as_mut() {
            callback(on);
        }
    }
}

impl Behavior for Relay {
    fn begin(&mut self, core: &mut DeviceCore, _now_ms: u64) {
        self.report(core);
    }

    fn tick(&mut self, core: &mut DeviceCore, now_ms: u64) {
        if self.expires_at.is_some_and(|expires| now_ms >= expires) {
            self.restore(core);
        }
        if self.flash_period_ms > 0 && now_ms >= self.flash_next_at {
            let period = self.flash_period_ms;
            self.toggle(core, period, now_ms);
            self.flash_next_at = now_ms.saturating_add(period * 2);
        }
    }

    fn handle_action(
        &mut self,
        core: &mut DeviceCore,
        action: &str,
        params: &Parameters,
        now_ms: u64,
    ) -> bool {
        if action != ACTION_STATE {
            return false;
        }
        let momentary = params.get_unsigned("momentary");
        if params.has("state") {
            self.cancel_flashing();
            self.set_relay(core, params.get_bool("state"), momentary, now_ms);
        } else if params.has("toggle") {
            self.cancel_flashing();
            self.toggle(core, momentary, now_ms);
        } else if params.has("flash") {
            self.flash(core, params.get_unsigned("flash"), now_ms);
        } else {
            return false;
        }
        true
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
