// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

use sync::Mutex;

pub use crate::{print, println, sm_println};

/// Interface for a console driver.
pub trait ConsoleDriver: Sync {
    /// Writes `bytes` to the console.
    fn write_bytes(&self, bytes: &[u8]);
}

/// Represents the system console, used by the `print!`, `println!` and `sm_println!` macros.
pub struct Console {
    driver: Option<&'static dyn ConsoleDriver>,
}

impl Console {
    const fn new() -> Self {
        Self { driver: None }
    }

    /// Sets the driver for the system console. Until then, output is dropped.
    pub fn set_driver(driver: &'static dyn ConsoleDriver) {
        CONSOLE.lock().driver = Some(driver);
    }

    /// Removes the driver, dropping any further output.
    pub fn clear_driver() {
        CONSOLE.lock().driver = None;
    }
}

/// The `Console` singleton.
pub static CONSOLE: Mutex<Console> = Mutex::new(Console::new());

/// `print` macro based on writing to `CONSOLE`.
#[macro_export]
macro_rules! print {
    ($($args:tt)*) => {
        {
            use core::fmt::Write;
            let _ = write!($crate::print::CONSOLE.lock(), $($args)*);
        }
    };
}

/// `println` macro based on writing to `CONSOLE`.
#[macro_export]
macro_rules! println {
    ($($args:tt)*) => {
        {
            use core::fmt::Write;
            let _ = writeln!($crate::print::CONSOLE.lock(), $($args)*);
        }
    };
}

/// `println` with the monitor's prefix, naming the hart given as the first argument.
#[macro_export]
macro_rules! sm_println {
    ($hart:expr, $($args:tt)*) => {
        {
            use core::fmt::Write;
            let mut console = $crate::print::CONSOLE.lock();
            let _ = write!(console, "M mode[hart {}]: ", $hart);
            let _ = writeln!(console, $($args)*);
        }
    };
}

impl core::fmt::Write for Console {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        if let Some(w) = self.driver {
            w.write_bytes(s.as_bytes());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::string::String;
    use std::vec::Vec;

    struct Capture(std::sync::Mutex<Vec<u8>>);

    impl ConsoleDriver for Capture {
        fn write_bytes(&self, bytes: &[u8]) {
            self.0.lock().unwrap().extend_from_slice(bytes);
        }
    }

    static CAPTURE: Capture = Capture(std::sync::Mutex::new(Vec::new()));

    #[test]
    fn prefixed_output() {
        print!("dropped {}", 1);
        Console::set_driver(&CAPTURE);
        sm_println!(3, "bitmap at {:#x}", 0x8020_0000u64);
        print!("x");
        Console::clear_driver();
        println!("dropped");
        let out = String::from_utf8(CAPTURE.0.lock().unwrap().clone()).unwrap();
        assert_eq!(out, "M mode[hart 3]: bitmap at 0x80200000\nx");
    }
}
