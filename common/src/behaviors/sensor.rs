use std::{any::Any, sync::Arc};

use log::{debug, info};

use super::on_off;
use crate::{
    device::{Behavior, DeviceCore},
    io::{EdgeCounter, InputPin, OutputPin},
    keys::{ATTR_LONG_PRESS, ATTR_STATE},
};

const DEBOUNCE_MS: u64 = 100;
const LONG_PRESS_MS: u64 = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PressKind {
    Short,
    Long,
}

impl PressKind {
    /// `None` for presses short enough to be contact bounce.
    pub fn classify(duration_ms: u64) -> Option<Self> {
        if duration_ms <= DEBOUNCE_MS {
            None
        } else if duration_ms > LONG_PRESS_MS {
            Some(Self::Long)
        } else {
            Some(Self::Short)
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Short => "false",
            Self::Long => "true",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct LongPress {
    active_level: bool,
    last_level: bool,
    press_start_ms: u64,
}

/// Digital input reported as on/off, with every edge surfaced to subscribers.
pub struct Sensor {
    input: Box<dyn InputPin>,
    edges: Arc<EdgeCounter>,
    invert: bool,
    follower: Option<Box<dyn OutputPin>>,
    long_press: Option<LongPress>,
    on_change: Option<Box<dyn FnMut(bool)>>,
}

impl Sensor {
    /// `edges` must be fed by the input's any-edge interrupt.
    pub fn new(input: impl InputPin + 'static, edges: Arc<EdgeCounter>, invert: bool) -> Self {
        Self {
            input: Box::new(input),
            edges,
            invert,
            follower: None,
            long_press: None,
            on_change: None,
        }
    }

    /// Mirrors the sensor state onto `output`, typically an LED.
    pub fn with_follower(mut self, output: impl OutputPin + 'static) -> Self {
        self.follower = Some(Box::new(output));
        self
    }

    /// Classifies activations at `active_level` into short and long presses.
    pub fn with_long_press(mut self, active_level: bool) -> Self {
        info!(
            "Long press enabled, active {}",
            if active_level { "HIGH" } else { "LOW" }
        );
        self.long_press = Some(LongPress {
            active_level,
            last_level: false,
            press_start_ms: 0,
        });
        self
    }

    pub fn on_change(mut self, callback: impl FnMut(bool) + 'static) -> Self {
        self.on_change = Some(Box::new(callback));
        self
    }

    pub fn edges(&self) -> Arc<EdgeCounter> {
        Arc::clone(&self.edges)
    }

    pub fn level(&mut self) -> bool {
        self.input.is_high() != self.invert
    }

    fn report(&mut self, core: &mut DeviceCore, now_ms: u64) {
        let level = self.level();

        if let Some(press) = self.long_press.as_mut() {
            let mut kind = None;
            if press.last_level != level {
                if level != press.active_level {
                    let duration = now_ms.saturating_sub(press.press_start_ms);
                    debug!("Pressed for {duration}ms");
                    kind = PressKind::classify(duration);
                }
                press.press_start_ms = now_ms;
            }
            press.last_level = level;
            core.set_attribute(ATTR_LONG_PRESS, kind.map_or("", PressKind::as_str));
        }

        if let Some(follower) = self.follower.as_mut() {
            follower.set_level(level);
        }
        core.publish(ATTR_STATE, on_off(level));

        if let Some(callback) = self.on_change.as_mut() {
            callback(level);
        }
    }
}

impl Behavior for Sensor {
    fn begin(&mut self, core: &mut DeviceCore, now_ms: u64) {
        self.edges.take();
        self.report(core, now_ms);
    }

    fn tick(&mut self, core: &mut DeviceCore, now_ms: u64) {
        let edges = self.edges.take();
        if edges == 0 {
            return;
        }
        debug!("Sensor {} saw {edges} edge(s)", core.udn());

        // Flip first so an edge is reported even when the level already looks unchanged.
        match core.get(ATTR_STATE) {
            Some("off") => {
                core.publish(ATTR_STATE, "on");
            }
            Some("on") => {
                core.publish(ATTR_STATE, "off");
            }
            _ => {}
        }
        self.report(core, now_ms);
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
