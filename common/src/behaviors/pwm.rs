use std::any::Any;

use log::info;

use super::{on_off, ACTION_STATE};
use crate::{
    device::{Behavior, DeviceCore},
    io::PwmOutput,
    keys::{ATTR_STATE, ATTR_VALUE},
    parameters::Parameters,
};

/// PWM output with an on/off switch and a level that survives switching off.
pub struct Dimmer {
    output: Box<dyn PwmOutput>,
    level: u32,
    on: bool,
    on_change: Option<Box<dyn FnMut(bool, u32)>>,
}

impl Dimmer {
    pub fn new(output: impl PwmOutput + 'static) -> Self {
        Self {
            output: Box::new(output),
            level: 0,
            on: false,
            on_change: None,
        }
    }

    pub fn on_change(mut self, callback: impl FnMut(bool, u32) + 'static) -> Self {
        self.on_change = Some(Box::new(callback));
        self
    }

    pub fn is_on(&self) -> bool {
        self.on
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    /// Stores the level; the output only follows while the dimmer is on.
    pub fn set_level(&mut self, core: &mut DeviceCore, level: u32) {
        self.level = level;
        if self.on {
            self.output.set_duty(level);
        }
        self.publish_level(core);
    }

    pub fn set_state(&mut self, core: &mut DeviceCore, on: bool) {
        self.on = on;
        self.output.set_duty(if on { self.level } else { 0 });
        self.publish_level(core);
    }

    fn publish_level(&mut self, core: &mut DeviceCore) {
        let changed = core.set_attribute(ATTR_STATE, on_off(self.on))
            | core.set_attribute(ATTR_VALUE, &self.level.to_string());
        if !changed {
            return;
        }
        core.notify();
        info!(
            "Dimmer {} level={} state={}",
            core.udn(),
            self.level,
            on_off(self.on)
        );
        if let Some(callback) = self.on_change.as_mut() {
            callback(self.on, self.level);
        }
    }
}

impl Behavior for Dimmer {
    fn begin(&mut self, core: &mut DeviceCore, _now_ms: u64) {
        self.output.set_duty(if self.on { self.level } else { 0 });
        core.set_attribute(ATTR_STATE, on_off(self.on));
        core.set_attribute(ATTR_VALUE, &self.level.to_string());
    }

    fn handle_action(
        &mut self,
        core: &mut DeviceCore,
        action: &str,
        params: &Parameters,
        _now_ms: u64,
    ) -> bool {
        if action != ACTION_STATE {
            return false;
        }
        if params.has("state") {
            self.set_state(core, params.get_bool("state"));
        } else if params.has("toggle") {
            self.set_state(core, !self.on);
        } else if params.has("level") {
            let level = u32::try_from(params.get_unsigned("level")).unwrap_or(u32::MAX);
            self.set_level(core, level);
        } else {
            return false;
        }
        true
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
