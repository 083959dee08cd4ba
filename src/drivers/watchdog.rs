// Bilateral Firmware - Task Watchdog

use crate::drivers::Watchdog;

/// Subscribes the calling task to the ESP-IDF task watchdog on creation, so
/// construct it on the thread that will feed it.
pub struct TaskWatchdog {
    subscribed: bool,
}

impl TaskWatchdog {
    pub fn subscribe_current() -> Self {
        let ret = unsafe { esp_idf_sys::esp_task_wdt_add(core::ptr::null_mut()) };
        if ret != esp_idf_sys::ESP_OK {
            log::warn!("task watchdog subscribe failed ({}), running unwatched", ret);
        }
        Self { subscribed: ret == esp_idf_sys::ESP_OK }
    }
}

impl Watchdog for TaskWatchdog {
    fn feed(&mut self) {
        if self.subscribed {
            unsafe {
                esp_idf_sys::esp_task_wdt_reset();
            }
        }
    }
}

impl Drop for TaskWatchdog {
    fn drop(&mut self) {
        if self.subscribed {
            unsafe {
                esp_idf_sys::esp_task_wdt_delete(core::ptr::null_mut());
            }
        }
    }
}
