//! Fault boundary around backend compiler calls.
//!
//! Native shader compilers crash on some inputs. Every call into a backend
//! goes through [`guard`], which turns a panic raised inside the call into a
//! [`CompilerFault`] the adapter can retry or report.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

/// A backend call that faulted instead of returning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilerFault {
    /// Which backend call faulted, e.g. `"compile"` or `"disassemble"`.
    pub operation: &'static str,
    pub message: String,
}

impl fmt::Display for CompilerFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} faulted: {}", self.operation, self.message)
    }
}

impl std::error::Error for CompilerFault {}

/// Run `call`, converting a panic into a [`CompilerFault`].
pub fn guard<T>(operation: &'static str, call: impl FnOnce() -> T) -> Result<T, CompilerFault> {
    panic::catch_unwind(AssertUnwindSafe(call)).map_err(|payload| CompilerFault {
        operation,
        message: panic_message(payload.as_ref()),
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown fault".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_passes_value_through() {
        assert_eq!(guard("compile", || 7), Ok(7));
    }

    #[test]
    fn test_guard_catches_str_panic() {
        let fault = guard("compile", || -> u32 { panic!("access violation") }).unwrap_err();
        assert_eq!(fault.operation, "compile");
        assert_eq!(fault.message, "access violation");
        assert_eq!(fault.to_string(), "compile faulted: access violation");
    }

    #[test]
    fn test_guard_catches_formatted_panic() {
        let fault = guard("reflect", || -> () { panic!("bad index {}", 3) }).unwrap_err();
        assert_eq!(fault.message, "bad index 3");
    }

    #[test]
    fn test_guard_catches_opaque_payload() {
        let fault = guard("disassemble", || -> () { std::panic::panic_any(42u8) }).unwrap_err();
        assert_eq!(fault.message, "unknown fault");
    }
}
