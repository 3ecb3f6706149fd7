//! Formatting of panic payloads caught by the event loop, and a hook that
//! traces where they were raised.

use std::{any::Any, backtrace::Backtrace, borrow::Cow, panic};

use tracing::{Level, debug};

/// Render a caught panic payload for logging.
///
/// String payloads are borrowed as-is; anything else falls back to the
/// opaque `Debug` form of [`Any`].
///
/// ```
/// use usocks::panic::format_panic;
/// let payload = std::panic::catch_unwind(|| panic!("boom")).unwrap_err();
/// assert_eq!(format_panic(payload.as_ref()), "boom");
/// assert_eq!(format_panic(&String::from("owned")), "owned");
/// assert!(format_panic(&5_u32).contains("Any"));
/// ```
#[must_use]
pub fn format_panic(payload: &(dyn Any + Send)) -> Cow<'_, str> {
    if let Some(message) = payload.downcast_ref::<String>() {
        Cow::Borrowed(message)
    } else if let Some(message) = payload.downcast_ref::<&'static str>() {
        Cow::Borrowed(message)
    } else {
        Cow::Owned(format!("{payload:?}"))
    }
}

/// Log a backtrace of every panic at debug level, then run the previous
/// hook.
///
/// The trace is taken on the panicking thread before the event loop
/// catches the unwind. Nothing is captured unless debug events are enabled.
pub fn install_backtrace_hook() {
    let previous = panic::take_hook();
    panic::set_hook(Box::new(move |info| {
        if tracing::enabled!(Level::DEBUG) {
            let location = info.location().map(ToString::to_string);
            debug!(
                layer = "tunnel",
                client = "-",
                location = location.as_deref().unwrap_or("-"),
                backtrace = %Backtrace::force_capture(),
                "panic backtrace"
            );
        }
        previous(info);
    }));
}

#[cfg(test)]
mod tests {
    use std::{
        io,
        sync::{Arc, Mutex},
    };

    use super::*;

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().expect("capture lock").extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> { Ok(()) }
    }

    impl Capture {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().expect("capture lock")).into_owned()
        }
    }

    fn capture_panic(level: Level) -> String {
        install_backtrace_hook();
        let capture = Capture::default();
        let writer = capture.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        let caught = tracing::subscriber::with_default(subscriber, || {
            panic::catch_unwind(|| panic!("handler blew up"))
        });
        assert!(caught.is_err());
        capture.text()
    }

    #[test]
    fn hook_traces_the_panic_site_at_debug() {
        let output = capture_panic(Level::DEBUG);
        assert!(output.contains("panic backtrace"));
        assert!(output.contains(file!()));
    }

    #[test]
    fn hook_stays_quiet_above_debug() {
        assert!(!capture_panic(Level::INFO).contains("panic backtrace"));
    }
}
