use colored::Colorize;
use std::fmt;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::registry::LookupSpan;

/// Event formatter for the demo's stdout: a colored level tag followed by
/// the event fields, with no timestamps or target noise.
pub struct ZoneLogFormatter;

impl<S, N> FormatEvent<S, N> for ZoneLogFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let level = *event.metadata().level();
        let tag = match level {
            Level::ERROR => "error".red().bold(),
            Level::WARN => " warn".yellow(),
            Level::INFO => " info".green(),
            Level::DEBUG => "debug".blue(),
            Level::TRACE => "trace".purple().dimmed(),
        };
        write!(writer, "{} ", tag)?;
        ctx.format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}
