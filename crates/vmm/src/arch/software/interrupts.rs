//! Emulated interrupt masking.
//!
//! Every host thread stands in for one hardware thread, so the interrupt-enable flag is
//! thread-local. Nested critical sections restore whatever state they found.

use core::cell::Cell;

std::thread_local! {
    static INTERRUPTS_ENABLED: Cell<bool> = const { Cell::new(true) };
}

/// Returns whether interrupts are enabled on the calling (emulated) hardware thread.
pub fn interrupts_enabled() -> bool {
    INTERRUPTS_ENABLED.with(Cell::get)
}

/// Runs `f` with interrupts disabled, restoring the previous state afterwards.
pub fn without_interrupts<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    let saved = INTERRUPTS_ENABLED.with(|enabled| enabled.replace(false));
    let result = f();
    INTERRUPTS_ENABLED.with(|enabled| enabled.set(saved));
    result
}
