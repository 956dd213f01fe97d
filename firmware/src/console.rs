// The serial diagnostic console.
//
// Session events logged through the `log` facade and the parameter table's
// reports both end up here, as `HH:mm:SS.mmm <line>` ASCII lines on the
// service UART. The writer sits behind a critical-section mutex so the
// logger can be the global `log` sink; the protocol core itself stays free
// of any I/O.

use core::cell::RefCell;
use core::fmt;
use core::fmt::Write as _;

use critical_section::Mutex;
use log::{Log, Metadata, Record};
use rtic_monotonics::Monotonic;

use c55demo::console::{ReportSink, Timestamp};

use crate::hardware::{ConsoleUart, Mono};

static CONSOLE: Mutex<RefCell<Option<ConsoleUart>>> = Mutex::new(RefCell::new(None));

fn now_ms() -> u32 {
    Mono::now().ticks() as u32
}

struct ConsoleLogger;

static LOGGER: ConsoleLogger = ConsoleLogger;

impl Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::Level::Info
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        critical_section::with(|cs| {
            if let Some(uart) = CONSOLE.borrow_ref_mut(cs).as_mut() {
                let _ = write!(uart, "{} -!- {}\r\n", Timestamp(now_ms()), record.args());
            }
        });
    }

    fn flush(&self) {}
}

/// Takes ownership of the console UART and routes `log` records onto it.
pub fn init(uart: ConsoleUart) {
    critical_section::with(|cs| {
        CONSOLE.borrow_ref_mut(cs).replace(uart);
    });
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(log::LevelFilter::Info);
    }
}

/// Sink handed to the parameter table; writes its `>>` / `-!-` lines onto
/// the same UART with the same timestamp prefix.
pub struct ConsoleSink;

impl ReportSink for ConsoleSink {
    fn line(&mut self, args: fmt::Arguments<'_>) {
        critical_section::with(|cs| {
            if let Some(uart) = CONSOLE.borrow_ref_mut(cs).as_mut() {
                let _ = write!(uart, "{} {}\r\n", Timestamp(now_ms()), args);
            }
        });
    }
}
