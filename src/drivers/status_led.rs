// Bilateral Firmware - Status LED
//
// Lit while this node's ACTIVE window runs.

use esp_idf_hal::gpio::{AnyOutputPin, Output, PinDriver};

use crate::drivers::Indicator;
use crate::events::Role;

pub struct StatusLed {
    pin: PinDriver<'static, AnyOutputPin, Output>,
}

impl StatusLed {
    pub fn new(pin: PinDriver<'static, AnyOutputPin, Output>) -> Self {
        Self { pin }
    }
}

impl Indicator for StatusLed {
    fn show(&mut self, _role: Role) {
        let _ = self.pin.set_high();
    }

    fn clear(&mut self) {
        let _ = self.pin.set_low();
    }
}
