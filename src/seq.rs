//! Circular 32-bit sequence and serial arithmetic.
//!
//! RxRPC sequence numbers and packet serials are 32-bit counters that wrap.
//! Ordering between two values is defined by signed 32-bit subtraction,
//! never by a raw `<` comparison: `a` is before `b` iff `(a - b) as i32`
//! is negative. The two number spaces are independent, so they get
//! separate newtypes.

use std::fmt;

macro_rules! circular_u32 {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
        pub struct $name(pub u32);

        impl $name {
            /// True iff `self` precedes `other` on the circle.
            pub fn before(self, other: $name) -> bool {
                (self.0.wrapping_sub(other.0) as i32) < 0
            }

            pub fn before_eq(self, other: $name) -> bool {
                (self.0.wrapping_sub(other.0) as i32) <= 0
            }

            pub fn after(self, other: $name) -> bool {
                (self.0.wrapping_sub(other.0) as i32) > 0
            }

            pub fn after_eq(self, other: $name) -> bool {
                (self.0.wrapping_sub(other.0) as i32) >= 0
            }

            /// Distance from `other` up to `self`, wrapping.
            pub fn sub(self, other: $name) -> u32 {
                self.0.wrapping_sub(other.0)
            }
        }

        impl std::ops::Add<u32> for $name {
            type Output = $name;

            fn add(self, rhs: u32) -> $name {
                $name(self.0.wrapping_add(rhs))
            }
        }

        impl std::ops::AddAssign<u32> for $name {
            fn add_assign(&mut self, rhs: u32) {
                self.0 = self.0.wrapping_add(rhs);
            }
        }

        impl std::ops::Sub<u32> for $name {
            type Output = $name;

            fn sub(self, rhs: u32) -> $name {
                $name(self.0.wrapping_sub(rhs))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:08x}", self.0)
            }
        }
    };
}

circular_u32!(Seq, "A DATA packet sequence number.");
circular_u32!(Serial, "A per-connection packet serial number.");
