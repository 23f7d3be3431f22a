use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};

pub trait InputPin {
    fn is_high(&mut self) -> bool;
}

pub trait OutputPin {
    fn set_level(&mut self, high: bool);
    /// Level last driven onto the pin.
    fn is_set_high(&self) -> bool;
}

pub trait PwmOutput {
    fn set_duty(&mut self, duty: u32);
}

impl<P: InputPin + ?Sized> InputPin for Box<P> {
    fn is_high(&mut self) -> bool {
        (**self).is_high()
    }
}

impl<P: OutputPin + ?Sized> OutputPin for Box<P> {
    fn set_level(&mut self, high: bool) {
        (**self).set_level(high);
    }

    fn is_set_high(&self) -> bool {
        (**self).is_set_high()
    }
}

impl<P: PwmOutput + ?Sized> PwmOutput for Box<P> {
    fn set_duty(&mut self, duty: u32) {
        (**self).set_duty(duty);
    }
}

/// Edge count shared between a pin interrupt (producer) and the tick (consumer).
#[derive(Debug, Default)]
pub struct EdgeCounter(AtomicU32);

impl EdgeCounter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Safe to call from an interrupt context.
    pub fn record(&self) {
        self.0.fetch_add(1, Ordering::AcqRel);
    }

    /// Reads and resets in one step so edges recorded meanwhile are never lost.
    pub fn take(&self) -> u32 {
        self.0.swap(0, Ordering::AcqRel)
    }
}
