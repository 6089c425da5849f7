#[cfg(test)]
use simplelog::{LevelFilter, TestLogger};

pub use ::log::{debug, error, info, log, trace, warn};

use std::sync::Arc;

use crate::host::{BusMessage, EmbedderBus};

/// Forwards `log` records to the embedder's console as `log` messages.
pub struct BusLogger {
    bus: Arc<dyn EmbedderBus>,
    level: log::LevelFilter,
}

impl BusLogger {
    pub fn new(bus: Arc<dyn EmbedderBus>, level: log::LevelFilter) -> BusLogger {
        BusLogger { bus, level }
    }

    /// Installs the logger process-wide.
    pub fn install(
        bus: Arc<dyn EmbedderBus>,
        level: log::LevelFilter,
    ) -> Result<(), log::SetLoggerError> {
        log::set_max_level(level);
        log::set_boxed_logger(Box::new(BusLogger::new(bus, level)))
    }
}

impl log::Log for BusLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            self.bus.post(BusMessage::Log(format!(
                "{} {}: {}",
                record.level(),
                record.target(),
                record.args()
            )));
        }
    }

    fn flush(&self) {}
}

#[cfg(test)]
pub fn init_test_log() {
    let _ = TestLogger::init(LevelFilter::Trace, simplelog::Config::default());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct CollectingBus(Mutex<Vec<BusMessage>>);

    impl EmbedderBus for CollectingBus {
        fn post(&self, msg: BusMessage) {
            self.0.lock().unwrap().push(msg);
        }
    }

    #[test]
    fn records_become_log_messages() {
        let bus = Arc::new(CollectingBus(Mutex::new(Vec::new())));
        let logger = BusLogger::new(bus.clone(), log::LevelFilter::Info);

        log::Log::log(
            &logger,
            &log::Record::builder()
                .level(log::Level::Info)
                .target("mosh_plugin::test")
                .args(format_args!("hello"))
                .build(),
        );
        log::Log::log(
            &logger,
            &log::Record::builder()
                .level(log::Level::Trace)
                .target("mosh_plugin::test")
                .args(format_args!("dropped"))
                .build(),
        );

        let msgs = bus.0.lock().unwrap();
        assert_eq!(msgs.len(), 1);
        assert!(
            matches!(&msgs[0], BusMessage::Log(s) if s.contains("hello") && s.contains("INFO"))
        );
    }
}
