//! The I/O port bus.
//!
//! A small ordered device list dispatches IN/OUT traffic, the same shape
//! `ConsoleManager` uses to fan a single call out to a named console.
//! Unmapped ports read back `0xFF` and discard writes rather than
//! faulting, matching real PC chipset behavior for unused port ranges.

pub mod keyboard;
pub mod uart;

use std::any::Any;

pub trait IoDevice: Any {
    /// Inclusive port range this device occupies.
    fn port_range(&self) -> (u16, u16);
    fn read(&mut self, port: u16) -> u8;
    fn write(&mut self, port: u16, value: u8);
    fn reset(&mut self) {}
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

pub struct IoBus {
    devices: Vec<Box<dyn IoDevice>>,
    /// Separate from `devices` because it is gated by its own
    /// `Config.enable_keyboard` flag rather than being unconditionally
    /// registered the way `Uart16550` is.
    keyboard: Option<Box<dyn IoDevice>>,
}

impl Default for IoBus {
    fn default() -> Self {
        Self { devices: Vec::new(), keyboard: None }
    }
}

impl IoBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, device: Box<dyn IoDevice>) {
        self.devices.push(device);
    }

    pub fn register_keyboard(&mut self, device: Box<dyn IoDevice>) {
        self.keyboard = Some(device);
    }

    fn find_mut(&mut self, port: u16) -> Option<&mut Box<dyn IoDevice>> {
        let keyboard_handles_port = self
            .keyboard
            .as_ref()
            .map(|d| { let (lo, hi) = d.port_range(); port >= lo && port <= hi })
            .unwrap_or(false);
        if keyboard_handles_port {
            return self.keyboard.as_mut();
        }
        self.devices
            .iter_mut()
            .find(|d| { let (lo, hi) = d.port_range(); port >= lo && port <= hi })
    }

    pub fn read(&mut self, port: u16) -> u8 {
        match self.find_mut(port) {
            Some(device) => device.read(port),
            None => {
                log::trace!("read from unmapped port {:#06x}", port);
                0xFF
            }
        }
    }

    pub fn write(&mut self, port: u16, value: u8) {
        match self.find_mut(port) {
            Some(device) => device.write(port, value),
            None => log::trace!("write {:#04x} to unmapped port {:#06x}", value, port),
        }
    }

    pub fn reset(&mut self) {
        for device in &mut self.devices {
            device.reset();
        }
        if let Some(device) = &mut self.keyboard {
            device.reset();
        }
    }

    /// Downcast the device occupying `port` to a concrete type, for host
    /// code (e.g. `Emulator::get_uart_output`) that needs a typed API the
    /// `IoDevice` trait doesn't expose.
    pub fn find_device_mut<T: IoDevice>(&mut self, port: u16) -> Option<&mut T> {
        self.find_mut(port)
            .and_then(|device| device.as_any_mut().downcast_mut::<T>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Toy(u8);
    impl IoDevice for Toy {
        fn port_range(&self) -> (u16, u16) {
            (0x40, 0x40)
        }
        fn read(&mut self, _port: u16) -> u8 {
            self.0
        }
        fn write(&mut self, _port: u16, value: u8) {
            self.0 = value;
        }
        fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
            self
        }
    }

    #[test]
    fn unmapped_port_reads_0xff_and_discards_writes() {
        let mut bus = IoBus::new();
        assert_eq!(bus.read(0x99), 0xFF);
        bus.write(0x99, 0x42); // must not panic
    }

    #[test]
    fn registered_device_handles_its_range() {
        let mut bus = IoBus::new();
        bus.register(Box::new(Toy(0)));
        bus.write(0x40, 7);
        assert_eq!(bus.read(0x40), 7);
    }

    #[test]
    fn keyboard_slot_is_empty_until_registered() {
        let mut bus = IoBus::new();
        assert_eq!(bus.read(keyboard::KEYBOARD_STATUS_PORT), 0xFF);
        bus.register_keyboard(Box::new(keyboard::Ps2Keyboard::new()));
        assert_eq!(bus.read(keyboard::KEYBOARD_STATUS_PORT), 0);
    }
}
