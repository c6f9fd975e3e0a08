use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

/// Runs a callback so that a panic inside it is turned into an error string
/// instead of unwinding through the caller's loop.
pub(crate) fn run_isolated<T>(f: impl FnOnce() -> T) -> Result<T, String> {
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(|payload| panic_message(payload.as_ref()))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_payload_is_captured_as_message() {
        let result: Result<(), String> = run_isolated(|| panic!("boom {}", 7));
        assert_eq!(result, Err("boom 7".to_string()));
    }

    #[test]
    fn successful_value_passes_through() {
        assert_eq!(run_isolated(|| 41 + 1), Ok(42));
    }
}
