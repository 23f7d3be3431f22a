use std::any::Any;

use log::info;

use super::{on_off, ACTION_STATE};
use crate::{
    device::{Behavior, DeviceCore},
    keys::{ATTR_STATE, ATTR_VALUE},
    parameters::Parameters,
};

/// Virtual device holding a number and an on/off flag set from outside.
#[derive(Default)]
pub struct Tracker {
    value: f32,
    on: bool,
    on_change: Option<Box<dyn FnMut(bool, f32)>>,
}

impl Tracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_change(mut self, callback: impl FnMut(bool, f32) + 'static) -> Self {
        self.on_change = Some(Box::new(callback));
        self
    }

    pub fn value(&self) -> f32 {
        self.value
    }

    pub fn is_on(&self) -> bool {
        self.on
    }

    pub fn set_value(&mut self, core: &mut DeviceCore, value: f32) {
        self.value = value;
        self.publish_value(core);
    }

    pub fn set_state(&mut self, core: &mut DeviceCore, on: bool) {
        self.on = on;
        self.publish_value(core);
    }

    fn publish_value(&mut self, core: &mut DeviceCore) {
        let changed = core.set_attribute(ATTR_STATE, on_off(self.on))
            | core.set_attribute(ATTR_VALUE, &format!("{:.2}", self.value));
        if !changed {
            return;
        }
        core.notify();
        info!(
            "Tracker {} value={:.2} state={}",
            core.udn(),
            self.value,
            on_off(self.on)
        );
        if let Some(callback) = self.on_change.as_mut() {
            callback(self.on, self.value);
        }
    }
}

impl Behavior for Tracker {
    fn begin(&mut self, core: &mut DeviceCore, _now_ms: u64) {
        core.set_attribute(ATTR_STATE, on_off(self.on));
        core.set_attribute(ATTR_VALUE, &format!("{:.2}", self.value));
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
        } else if params.has("value") {
            self.set_value(core, params.get_float("value"));
        } else {
            return false;
        }
        true
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
