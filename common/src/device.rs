use std::any::Any;

use crate::{
    attributes::AttributeStore,
    keys::{ATTR_GROUP, ATTR_LOCATION, ATTR_MAC, ATTR_NAME, ATTR_UDN},
    parameters::Parameters,
    types::DeviceType,
};

/// Device-specific state machine plugged into a [`Device`].
pub trait Behavior: Any {
    fn begin(&mut self, _core: &mut DeviceCore, _now_ms: u64) {}

    fn tick(&mut self, _core: &mut DeviceCore, _now_ms: u64) {}

    /// Returns true when the action was recognised and applied.
    fn handle_action(
        &mut self,
        _core: &mut DeviceCore,
        _action: &str,
        _params: &Parameters,
        _now_ms: u64,
    ) -> bool {
        false
    }

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Behavior for devices driven entirely from outside, e.g. reporters.
#[derive(Debug, Default)]
pub struct Passive;

impl Behavior for Passive {
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

pub type ActionHandler = Box<dyn FnMut(&mut DeviceCore, &str, &Parameters) -> bool>;

/// Attributes of one device plus the notifications waiting to go out.
#[derive(Debug)]
pub struct DeviceCore {
    device_type: DeviceType,
    attributes: AttributeStore,
    location: Option<String>,
    pending: Vec<String>,
}

impl DeviceCore {
    pub fn new(device_type: DeviceType) -> Self {
        Self {
            device_type,
            attributes: AttributeStore::new(),
            location: None,
            pending: Vec::new(),
        }
    }

    pub fn device_type(&self) -> DeviceType {
        self.device_type
    }

    pub fn udn(&self) -> &str {
        self.attributes.get(ATTR_UDN).unwrap_or_default()
    }

    pub fn name(&self) -> &str {
        self.attributes.get(ATTR_NAME).unwrap_or_default()
    }

    /// Assigns identity attributes without notifying anyone.
    pub fn begin(&mut self, udn: &str, name: Option<&str>, group: &str, mac: &str) {
        self.attributes.set(ATTR_UDN, Some(udn));
        self.attributes.set(ATTR_MAC, Some(mac));
        self.attributes
            .set(ATTR_NAME, Some(name.filter(|name| !name.is_empty()).unwrap_or(udn)));
        self.attributes.set(ATTR_GROUP, Some(group));
    }

    /// Sets an attribute without notification. An empty value removes it.
    pub fn set_attribute(&mut self, key: &str, value: &str) -> bool {
        self.attributes.set(key, Some(value))
    }

    /// Sets an attribute and queues a notification when it changed.
    pub fn publish(&mut self, key: &str, value: &str) -> bool {
        let changed = self.set_attribute(key, value);
        if changed {
            self.notify();
        }
        changed
    }

    /// Queues the current state for every live subscriber.
    pub fn notify(&mut self) {
        let snapshot = self.serialize_state();
        self.pending.push(snapshot);
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.attributes.get(key)
    }

    pub fn has(&self, key: &str) -> bool {
        self.attributes.has(key)
    }

    pub fn attributes(&self) -> &AttributeStore {
        &self.attributes
    }

    /// Base URL of the node while it has an address.
    pub fn set_location(&mut self, location: Option<String>) {
        self.location = location;
    }

    pub fn serialize_state(&mut self) -> String {
        let location = self.location.clone().unwrap_or_default();
        self.attributes.set(ATTR_LOCATION, Some(&location));
        self.attributes.to_json()
    }

    pub fn take_notifications(&mut self) -> Vec<String> {
        std::mem::take(&mut self.pending)
    }
}

pub struct Device {
    core: DeviceCore,
    behavior: Box<dyn Behavior>,
    action_handler: Option<ActionHandler>,
}

impl Device {
    pub fn new(device_type: DeviceType, behavior: impl Behavior) -> Self {
        Self {
            core: DeviceCore::new(device_type),
            behavior: Box::new(behavior),
            action_handler: None,
        }
    }

    pub fn passive(device_type: DeviceType) -> Self {
        Self::new(device_type, Passive)
    }

    pub fn udn(&self) -> &str {
        self.core.udn()
    }

    pub fn core(&self) -> &DeviceCore {
        &self.core
    }

    pub fn core_mut(&mut self) -> &mut DeviceCore {
        &mut self.core
    }

    /// Fallback for actions the behavior does not handle.
    pub fn set_action_handler(
        &mut self,
        handler: impl FnMut(&mut DeviceCore, &str, &Parameters) -> bool + 'static,
    ) {
        self.action_handler = Some(Box::new(handler));
    }

    pub fn begin(&mut self, udn: &str, name: Option<&str>, group: &str, mac: &str, now_ms: u64) {
        self.core.begin(udn, name, group, mac);
        self.behavior.begin(&mut self.core, now_ms);
    }

    pub fn tick(&mut self, now_ms: u64) {
        self.behavior.tick(&mut self.core, now_ms);
    }

    pub fn handle_action(&mut self, action: &str, params: &Parameters, now_ms: u64) -> bool {
        if self
            .behavior
            .handle_action(&mut self.core, action, params, now_ms)
        {
            return true;
        }
        match self.action_handler.as_mut() {
            Some(handler) => handler(&mut self.core, action, params),
            None => false,
        }
    }

    pub fn publish(&mut self, key: &str, value: &str) -> bool {
        self.core.publish(key, value)
    }

    pub fn set_attribute(&mut self, key: &str, value: &str) -> bool {
        self.core.set_attribute(key, value)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.core.get(key)
    }

    pub fn has(&self, key: &str) -> bool {
        self.core.has(key)
    }

    pub fn serialize_state(&mut self) -> String {
        self.core.serialize_state()
    }

    pub fn set_location(&mut self, location: Option<String>) {
        self.core.set_location(location);
    }

    pub fn take_notifications(&mut self) -> Vec<String> {
        self.core.take_notifications()
    }

    /// Typed access to the behavior together with the core it drives.
    pub fn behavior_mut<B: Behavior>(&mut self) -> Option<(&mut B, &mut DeviceCore)> {
        let behavior = self.behavior.as_any_mut().downcast_mut::<B>()?;
        Some((behavior, &mut self.core))
    }
}
