use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::MakeWriterExt;

/// Installs the global subscriber. With `dir` set, events go to a daily
/// rolling `flexpar.log` there; the returned guard must outlive logging.
pub fn init_tracing(dir: Option<&str>, alsologtostderr: bool, verbose: bool) -> Option<WorkerGuard> {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    let builder = tracing_subscriber::fmt().with_max_level(level);
    let format = tracing_subscriber::fmt::format()
        .with_line_number(true)
        .compact();
    let Some(dir) = dir else {
        builder.event_format(format).init();
        return None;
    };
    let file_appender = tracing_appender::rolling::daily(dir, "flexpar.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    if alsologtostderr {
        builder
            .with_writer(non_blocking.and(std::io::stderr))
            .event_format(format)
            .init();
    } else {
        builder
            .with_writer(non_blocking)
            .with_ansi(false)
            .event_format(format)
            .init();
    }
    Some(guard)
}
