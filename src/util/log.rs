use std::fmt::{Debug, Display, Formatter};

use super::{Code, Log};

impl<T: Display> Display for Log<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Log::None => Ok(()),
            Log::Default(s) | Log::Success(s) | Log::Result(s) | Log::Verbose(s) => {
                write!(f, "{}", s)
            }
        }
    }
}

impl<T> Log<T> {
    /// Order of the log level, used to decide whether a given trace point should fire.
    pub fn order(&self) -> u8 {
        match self {
            Log::None => 0,
            Log::Default(_) => 1,
            Log::Success(_) => 2,
            Log::Result(_) => 3,
            Log::Verbose(_) => 4,
        }
    }
}

impl<TL: Display> Log<TL> {
    /// Trace a successful match of `value` at `pointer`.
    pub fn trace_success<T: Debug>(&self, pointer: usize, value: &T, code: &Code) {
        #[cfg(debug_assertions)]
        if self.order() >= Log::Success(()).order() {
            println!(
                "[{}; Success]: {:?} at {}",
                self,
                value,
                code.obtain_position(pointer)
            )
        }
        #[cfg(not(debug_assertions))]
        {
            let _ = (pointer, value, code);
        }
    }

    /// Trace a failed match at `pointer`.
    pub fn trace_failure(&self, pointer: usize, code: &Code) {
        #[cfg(debug_assertions)]
        if self.order() >= Log::Result(()).order() {
            println!("[{}; Failure]: at {}", self, code.obtain_position(pointer))
        }
        #[cfg(not(debug_assertions))]
        {
            let _ = (pointer, code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_is_monotonic_with_verbosity() {
        assert!(Log::None::<&str>.order() < Log::Default("x").order());
        assert!(Log::Default("x").order() < Log::Success("x").order());
        assert!(Log::Success("x").order() < Log::Result("x").order());
        assert!(Log::Result("x").order() < Log::Verbose("x").order());
    }
}
