//! Log line formatting for the mesh node.
//!
//! Lines look like `[timestamp] [component] [level] message key=value ...`.
//! A `component` field on the event selects the middle column; the
//! `component_*!` macros set it.

use std::fmt::{self, Write as _};
use std::io::IsTerminal;
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::{format::Writer, FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

const COLOR_RESET: &str = "\x1b[0m";
const COLOR_CYAN: &str = "\x1b[36m";
const COLOR_GREEN: &str = "\x1b[32m";
const COLOR_BRIGHT_YELLOW: &str = "\x1b[93m";
const COLOR_BRIGHT_RED: &str = "\x1b[91m";
const COLOR_BRIGHT_GRAY: &str = "\x1b[90m";

const COMPONENT_WIDTH: usize = 16;
const LOG_LEVEL_WIDTH: usize = 7;

/// Crates whose level follows `--log-level`
const MESH_TARGETS: &[&str] = &["mesh", "mesh_node", "mesh_session", "mesh_wire", "mesh_control"];

/// Event formatter for the node's log output
pub struct MeshLogFormatter {
    service_name: String,
    color_enabled: bool,
}

#[macro_export]
macro_rules! component_info {
    ($component:expr, $($arg:tt)*) => {
        tracing::info!(component = $component, $($arg)*)
    };
}

#[macro_export]
macro_rules! component_warn {
    ($component:expr, $($arg:tt)*) => {
        tracing::warn!(component = $component, $($arg)*)
    };
}

#[macro_export]
macro_rules! component_debug {
    ($component:expr, $($arg:tt)*) => {
        tracing::debug!(component = $component, $($arg)*)
    };
}

#[macro_export]
macro_rules! component_error {
    ($component:expr, $($arg:tt)*) => {
        tracing::error!(component = $component, $($arg)*)
    };
}

impl MeshLogFormatter {
    pub fn new(service_name: impl Into<String>, color_enabled: bool) -> Self {
        Self {
            service_name: service_name.into(),
            color_enabled,
        }
    }

    fn format_component(&self, component: Option<&str>) -> String {
        let name = match component {
            Some(comp) => format!("{}-{}", self.service_name, comp),
            None => self.service_name.clone(),
        };

        if name.chars().count() > COMPONENT_WIDTH {
            let truncated: String = name.chars().take(COMPONENT_WIDTH - 1).collect();
            format!("{}…", truncated)
        } else {
            format!("{:<width$}", name, width = COMPONENT_WIDTH)
        }
    }

    fn format_log_level(&self, level: &tracing::Level) -> String {
        let level_str = match *level {
            tracing::Level::ERROR => "✗ ERROR",
            tracing::Level::WARN => "⚠ WARN",
            tracing::Level::INFO => "ℹ INFO",
            tracing::Level::DEBUG => "◦ DEBUG",
            tracing::Level::TRACE => "◦ TRACE",
        };
        format!("{:<width$}", level_str, width = LOG_LEVEL_WIDTH + 2)
    }

    fn color_for_level(&self, level: &tracing::Level) -> &'static str {
        if !self.color_enabled {
            return "";
        }

        match *level {
            tracing::Level::ERROR => COLOR_BRIGHT_RED,
            tracing::Level::WARN => COLOR_BRIGHT_YELLOW,
            tracing::Level::INFO => COLOR_GREEN,
            tracing::Level::DEBUG | tracing::Level::TRACE => COLOR_BRIGHT_GRAY,
        }
    }
}

impl<S, N> FormatEvent<S, N> for MeshLogFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let level = event.metadata().level();

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        let color = self.color_for_level(level);
        let reset = if self.color_enabled { COLOR_RESET } else { "" };
        let cyan = if self.color_enabled { COLOR_CYAN } else { "" };

        write!(
            writer,
            "{}[{}] [{}] [{}{}{}] ",
            cyan,
            timestamp,
            self.format_component(visitor.component.as_deref()),
            color,
            self.format_log_level(level),
            reset
        )?;
        writeln!(writer, "{}{}{}", visitor.message, visitor.fields, reset)
    }
}

/// Collects the message, the component and any other fields of an event
#[derive(Default)]
struct FieldVisitor {
    message: String,
    component: Option<String>,
    fields: String,
}

impl tracing::field::Visit for FieldVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        match field.name() {
            "message" => self.message = format!("{:?}", value),
            "component" => {
                self.component = Some(format!("{:?}", value).trim_matches('"').to_string())
            }
            name => {
                let _ = write!(self.fields, " {}={:?}", name, value);
            }
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        match field.name() {
            "message" => self.message = value.to_string(),
            "component" => self.component = Some(value.to_string()),
            name => {
                let _ = write!(self.fields, " {}={}", name, value);
            }
        }
    }
}

/// Install the global subscriber; logs go to stderr so `send` output stays clean
pub fn init_logging(log_level: &str) -> anyhow::Result<()> {
    let mut env_filter = EnvFilter::new("warn");
    for target in MESH_TARGETS {
        env_filter = env_filter.add_directive(format!("{}={}", target, log_level).parse()?);
    }

    let stderr = std::io::stderr();
    let formatter = MeshLogFormatter::new("mesh", stderr.is_terminal());

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .event_format(formatter)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to install log subscriber: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_component_column() {
        let formatter = MeshLogFormatter::new("mesh", false);
        assert_eq!(formatter.format_component(None), format!("{:<16}", "mesh"));
        assert_eq!(
            formatter.format_component(Some("control")),
            format!("{:<16}", "mesh-control")
        );

        let long = formatter.format_component(Some("supervisor-outbound"));
        assert_eq!(long.chars().count(), COMPONENT_WIDTH);
        assert!(long.ends_with('…'));
    }

    #[test]
    fn test_no_color_when_disabled() {
        let formatter = MeshLogFormatter::new("mesh", false);
        assert_eq!(formatter.color_for_level(&tracing::Level::ERROR), "");
        let colored = MeshLogFormatter::new("mesh", true);
        assert_eq!(colored.color_for_level(&tracing::Level::ERROR), COLOR_BRIGHT_RED);
    }

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for Capture {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_line_layout_keeps_structured_fields() {
        let capture = Capture::default();
        let writer = capture.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .event_format(MeshLogFormatter::new("mesh", false))
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            crate::component_info!("control", socket = "/tmp/mesh.sock", "Opening control socket");
        });

        let line = String::from_utf8(capture.0.lock().unwrap().clone()).unwrap();
        assert!(line.starts_with('['));
        assert!(line.contains("[mesh-control    ]"));
        assert!(line.contains("ℹ INFO"));
        assert!(line.trim_end().ends_with("Opening control socket socket=/tmp/mesh.sock"));
    }
}
