// Bilateral Firmware - Haptic Motor Driver
//
// ERM motor behind an H-bridge, driven by LEDC PWM so intensity maps to duty.

use esp_idf_hal::ledc::LedcDriver;

use crate::drivers::Actuator;

pub struct HapticDriver {
    pwm: LedcDriver<'static>,
}

impl HapticDriver {
    pub fn new(mut pwm: LedcDriver<'static>) -> Self {
        // Start de-energised no matter what the channel was left at.
        let _ = pwm.set_duty(0);
        Self { pwm }
    }

    fn duty_for(&self, intensity_pct: u8) -> u32 {
        self.pwm.get_max_duty() * intensity_pct.min(100) as u32 / 100
    }
}

impl Actuator for HapticDriver {
    fn actuator_on(&mut self, intensity_pct: u8) {
        let duty = self.duty_for(intensity_pct);
        if let Err(e) = self.pwm.set_duty(duty) {
            log::error!(target: "coordination", "haptic PWM error: {}", e);
        }
    }

    fn actuator_off(&mut self) {
        if let Err(e) = self.pwm.set_duty(0) {
            log::error!(target: "coordination", "haptic PWM error on stop: {}", e);
            // Last resort: stop the LEDC channel outright.
            let _ = self.pwm.disable();
        }
    }
}
