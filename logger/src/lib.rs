use log::{LevelFilter, Log, Metadata, Record};
use once_cell::sync::OnceCell;
use std::process;

/// Output format of log lines
#[derive(clap::ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// `[info] message`, meant for a human at a terminal
    #[default]
    Text,
    /// logfmt (https://www.brandur.org/logfmt)
    Logfmt,
}

/// A logger instance for command line usage
#[derive(Debug)]
pub struct FleetLogger {
    format: LogFormat,
}

static FLEET_LOGGER: OnceCell<FleetLogger> = OnceCell::new();

impl FleetLogger {
    pub fn init(format: LogFormat, level_filter: LevelFilter) {
        let logger = FLEET_LOGGER.get_or_init(|| FleetLogger { format });
        // This function gets called multiple times by the tests so ignore the error.
        let _ = log::set_logger(logger).map(|()| log::set_max_level(level_filter));
    }

    pub fn global() -> &'static FleetLogger {
        FLEET_LOGGER.get().expect("logger is not initialized")
    }

    pub fn format(&self) -> LogFormat {
        self.format
    }

    fn render(&self, record: &Record) -> String {
        let level = record.level().to_string().to_lowercase();
        match self.format {
            LogFormat::Text => format!("[{}] {}", level, record.args()),
            LogFormat::Logfmt => format!(
                "level={} pid={} message=\"{}\" target=\"{}\"",
                level,
                process::id(),
                escape(&record.args().to_string()),
                record.target()
            ),
        }
    }
}

fn escape(message: &str) -> String {
    message
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
        .replace('\r', "\\r")
}

impl Log for FleetLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            println!("{}", self.render(record));
        }
    }

    fn flush(&self) {}
}

#[test]
pub fn test_log() {
    use log::MetadataBuilder;

    FleetLogger::init(LogFormat::Text, LevelFilter::Info);
    assert_eq!(LogFormat::Text, FleetLogger::global().format());

    let metadata = MetadataBuilder::new().level(log::Level::Debug).build();
    assert!(!FleetLogger::global().enabled(&metadata));

    let metadata = MetadataBuilder::new().level(log::Level::Info).build();
    assert!(FleetLogger::global().enabled(&metadata));

    let metadata = MetadataBuilder::new().level(log::Level::Warn).build();
    assert!(FleetLogger::global().enabled(&metadata));
}

#[cfg(test)]
fn render_warning(logger: &FleetLogger, message: &str) -> String {
    logger.render(
        &Record::builder()
            .args(format_args!("{}", message))
            .level(log::Level::Warn)
            .target("keyfleet::fleet")
            .build(),
    )
}

#[test]
pub fn test_render() {
    let text = FleetLogger {
        format: LogFormat::Text,
    };
    let logfmt = FleetLogger {
        format: LogFormat::Logfmt,
    };
    let message = "key revoked from \"web-00\"";

    assert_eq!(
        render_warning(&text, message),
        "[warn] key revoked from \"web-00\""
    );
    let line = render_warning(&logfmt, message);
    assert!(line.starts_with("level=warn pid="));
    assert!(line.ends_with(
        "message=\"key revoked from \\\"web-00\\\"\" target=\"keyfleet::fleet\""
    ));
}

#[test]
pub fn test_logfmt_keeps_one_record_per_line() {
    let logfmt = FleetLogger {
        format: LogFormat::Logfmt,
    };
    let line = render_warning(&logfmt, "failed to connect\nssh: Connection refused\r\n");
    assert!(!line.contains('\n'));
    assert!(!line.contains('\r'));
    assert!(line.contains(
        "message=\"failed to connect\\nssh: Connection refused\\r\\n\""
    ));
}
