//! Machine-dependent constants and primitives.
//!
//! Kernel builds on x86_64 use [`x86_64`]. Tests and the `software-emulation` feature use
//! [`software`], a scale model of a MIPS R3000 with a software-refilled TLB.

// Compiled on x86_64 even under test so it keeps type-checking; only exported for real
// kernel builds.
#[cfg(target_arch = "x86_64")]
#[cfg_attr(any(test, feature = "software-emulation"), allow(dead_code))]
mod x86_64;
#[cfg(all(target_arch = "x86_64", not(test), not(feature = "software-emulation")))]
pub use self::x86_64::*;

#[cfg(any(test, feature = "software-emulation"))]
mod software;
#[cfg(any(test, feature = "software-emulation"))]
pub use software::*;
