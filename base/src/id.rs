//! Typed 32-bit ids with an invalid sentinel.

use std::sync::atomic::{AtomicU32, Ordering};

/// Produces dense, non-zero raw values for one id family.
#[derive(Debug)]
pub struct IdGenerator {
    next: AtomicU32,
}

impl IdGenerator {
    pub fn new() -> IdGenerator {
        IdGenerator { next: AtomicU32::new(1) }
    }

    /// Never returns zero: zero is the invalid sentinel of every id type.
    pub fn next_raw(&self) -> u32 {
        let raw = self.next.fetch_add(1, Ordering::Relaxed);
        assert_ne!(raw, 0, "id generator wrapped around");
        raw
    }
}

impl Default for IdGenerator {
    fn default() -> IdGenerator {
        IdGenerator::new()
    }
}

/// Declares a `u32` newtype id with `INVALID = 0` and a tagged `Debug` form.
#[macro_export]
macro_rules! define_id_type {
    ($(#[$meta:meta])* $vis:vis struct $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        $vis struct $name(u32);

        impl $name {
            pub const INVALID: $name = $name(0);

            pub fn from_raw(raw: u32) -> $name {
                $name(raw)
            }

            pub fn from_generator(generator: &$crate::IdGenerator) -> $name {
                $name(generator.next_raw())
            }

            pub fn raw(self) -> u32 {
                self.0
            }

            pub fn is_valid(self) -> bool {
                self.0 != 0
            }
        }

        impl Default for $name {
            fn default() -> $name {
                $name::INVALID
            }
        }

        impl ::std::fmt::Debug for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
                if self.is_valid() {
                    write!(f, concat!(stringify!($name), "({})"), self.0)
                } else {
                    f.write_str(concat!(stringify!($name), "(invalid)"))
                }
            }
        }
    };
}
