//! Routes `log` records to whatever console the kernel has.

use log::{LevelFilter, Metadata, Record, SetLoggerError};
use once_cell::race::OnceBox;

/// Writes one formatted line to the console.
pub type Sink = fn(core::fmt::Arguments);

static LOGGER: KernelLogger = KernelLogger;
static SINK: OnceBox<Sink> = OnceBox::new();

struct KernelLogger;

impl log::Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        if let Some(sink) = SINK.get() {
            sink(format_args!(
                "[{:<5} {}] {}",
                record.level(),
                record.target(),
                record.args()
            ));
        }
    }

    fn flush(&self) {}
}

/// Installs the kernel logger, writing through `sink`. Only the first call
/// has any effect.
pub fn init(max_level: LevelFilter, sink: Sink) -> Result<(), SetLoggerError> {
    let _ = SINK.set(alloc::boxed::Box::new(sink));
    log::set_logger(&LOGGER)?;
    log::set_max_level(max_level);
    Ok(())
}

#[cfg(test)]
pub(crate) fn init_for_tests() {
    let _ = init(LevelFilter::Trace, |args| std::eprintln!("{args}"));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_is_refused() {
        init_for_tests();
        assert!(init(LevelFilter::Off, |_| {}).is_err());
        assert_eq!(log::max_level(), LevelFilter::Trace);
        log::debug!("logger still works");
    }
}
