//! Log-and-pass-through helper for fallible calls whose error is handled
//! further up, or deliberately ignored.

use std::fmt::Display;
use std::panic::Location;

pub trait ResultExt<T, E> {
    /// Log the error, tagged with `context` and the calling line, and return
    /// the result unchanged.
    fn log(self, context: impl Display) -> Result<T, E>;
}

impl<T, E: Display> ResultExt<T, E> for Result<T, E> {
    #[track_caller]
    fn log(self, context: impl Display) -> Result<T, E> {
        if let Err(e) = &self {
            let at = Location::caller();
            tracing::error!(
                target: "tessera_engine",
                error = %e,
                file = at.file(),
                line = at.line(),
                "Failed {}",
                context
            );
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_passes_result_through() {
        let ok: Result<u64, String> = Ok(7);
        assert_eq!(ok.log("reading watermark").unwrap(), 7);

        let err: Result<u64, String> = Err("gone".into());
        assert_eq!(err.log("reading watermark").unwrap_err(), "gone");
    }
}
