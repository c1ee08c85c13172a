//! The single exit point for unrecoverable misconfiguration.
//!
//! Flag lookups with the wrong name or type and broken metrics wiring are
//! programmer errors. They end up here, where the default handler logs one
//! line and exits the process. Tests swap the handler with
//! [`set_fatal_handler`] to observe the fatal path without exiting.

use log::Level;
use std::{
    fmt::Display,
    process,
    sync::{PoisonError, RwLock},
};

/// A function that reports a fatal message and never returns.
pub type FatalHandler = fn(&str) -> !;

static FATAL_HANDLER: RwLock<FatalHandler> = RwLock::new(exit_with_error as FatalHandler);

/// The default [`FatalHandler`]: logs `message` at error level and exits with status 1.
///
/// If no `log` implementation is enabled for errors, the message goes to stderr instead so it
/// is never lost.
pub fn exit_with_error(message: &str) -> ! {
    if log::log_enabled!(Level::Error) {
        log::error!("{message}");
    } else {
        eprintln!("{message}");
    }
    process::exit(1)
}

/// Replaces the process-wide fatal handler, returning the previous one.
pub fn set_fatal_handler(handler: FatalHandler) -> FatalHandler {
    let mut current = FATAL_HANDLER
        .write()
        .unwrap_or_else(PoisonError::into_inner);
    std::mem::replace(&mut *current, handler)
}

/// Reports `message` through the installed fatal handler.
pub fn fatal(message: impl Display) -> ! {
    let handler = *FATAL_HANDLER.read().unwrap_or_else(PoisonError::into_inner);
    handler(&message.to_string())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::panic;

    pub(crate) fn panicking(message: &str) -> ! {
        panic!("fatal: {message}")
    }

    /// Runs `f` with a panicking fatal handler and returns the fatal message, if any.
    pub(crate) fn fatal_message<T>(f: impl FnOnce() -> T) -> Option<String> {
        set_fatal_handler(panicking);
        let payload = panic::catch_unwind(panic::AssertUnwindSafe(f)).err()?;
        payload
            .downcast_ref::<String>()
            .cloned()
            .or_else(|| payload.downcast_ref::<&str>().map(|s| s.to_string()))
    }

    #[test]
    fn fatal_goes_through_installed_handler() {
        let message = fatal_message(|| fatal("flag accessed but not defined: port"));
        assert_eq!(
            message.as_deref(),
            Some("fatal: flag accessed but not defined: port")
        );
    }

    #[test]
    fn no_message_when_nothing_fails() {
        assert_eq!(fatal_message(|| 1 + 1), None);
    }
}
