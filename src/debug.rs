//! Debug logging over the USB serial/JTAG console.
//!
//! Implements the `log` facade. Records are formatted into a fixed buffer
//! and queued without blocking; a writer task drains the queue to the
//! console. Records are dropped if the queue is full or the host is not
//! listening.

use core::fmt::Write;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use heapless::String;
use log::{LevelFilter, Log, Metadata, Record};

/// Maximum length of a single log line
const MAX_LINE_LEN: usize = 192;

/// Lines buffered ahead of the writer task
const QUEUE_DEPTH: usize = 8;

type Line = String<MAX_LINE_LEN>;

static LOG_CHANNEL: Channel<CriticalSectionRawMutex, Line, QUEUE_DEPTH> = Channel::new();

static LOGGER: ConsoleLogger = ConsoleLogger;

struct ConsoleLogger;

impl Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut line = Line::new();
        let ms = embassy_time::Instant::now().as_millis();
        // Over-long lines are truncated
        let _ = write!(line, "{:>8} {:<5} {}", ms, record.level(), record.args());
        let _ = LOG_CHANNEL.try_send(line);
    }

    fn flush(&self) {}
}

/// Install the logger.
///
/// Must be called once during startup before any task logs.
pub fn init(level: LevelFilter) {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}

/// Writer task that prints queued log lines to the console.
pub async fn log_writer_task() {
    loop {
        let line = LOG_CHANNEL.receive().await;
        esp_println::println!("{}", line);
    }
}
