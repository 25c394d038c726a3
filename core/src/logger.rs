use tracing::{debug, level_filters::LevelFilter};
use tracing_subscriber::{
    fmt::{
        format::{Format, Writer},
        time::FormatTime,
    },
    EnvFilter,
};

/// Local wall clock time with microseconds, e.g. `18 October - 14:02:11.532104`.
struct WriterTimer;

impl FormatTime for WriterTimer {
    fn format_time(&self, writer: &mut Writer<'_>) -> std::fmt::Result {
        let now = chrono::Local::now();
        write!(writer, "{} - {}", now.format("%d %B"), now.format("%H:%M:%S%.6f"))
    }
}

/// Installs the global subscriber. `RUST_LOG` directives are honoured on top of
/// `log_level`. Statement shapes and chunk progress are logged at `debug`, so
/// targets are shown at that level to tell the writer modules apart.
pub fn setup_logger(log_level: LevelFilter) {
    let filter = EnvFilter::from_default_env().add_directive(log_level.into());

    let format = Format::default()
        .with_timer(WriterTimer)
        .with_level(true)
        .with_target(log_level >= LevelFilter::DEBUG);

    let subscriber =
        tracing_subscriber::fmt().with_env_filter(filter).event_format(format).finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        debug!("Logger has already been set up, continuing...");
    }
}

pub fn setup_info_logger() {
    setup_logger(LevelFilter::INFO);
}
