// src/macros.rs

/// Logs a structured line tagged with a component, pid and tid.
///
/// The component doubles as the `log` target, so a monitor built with its
/// own target can be filtered or routed independently by the dispatcher.
/// Usage:
/// ```rust
/// use log::Level;
/// procwatch::procwatch_log!(Level::Info, "procwatch::monitor", "listener started");
/// procwatch::procwatch_log!(Level::Error, "procwatch::monitor", "subscribe failed: {}", 5);
/// ```
/// Logs like:
/// [procwatch::monitor][pid=4568][tid=ThreadId(3)] listener started
#[macro_export]
macro_rules! procwatch_log {
    ($level:expr, $component:expr, $fmt:expr $(, $($arg:tt)+)?) => {{
        let component: &str = $component;
        log::log!(
            target: component,
            $level,
            "[{}][pid={}][tid={:?}] {}",
            component,
            std::process::id(),
            std::thread::current().id(),
            format_args!($fmt $(, $($arg)+)?)
        );
    }};
}
