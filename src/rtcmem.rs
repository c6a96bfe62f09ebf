//! State that survives deep sleep in RTC fast memory.
//!
//! One magic-validated block holds everything the next wake needs: the
//! engine's one-byte cycle cell, the stored integrity token, and the wall
//! clock recovered from HTTP `Date` headers (kept as an offset against the
//! RTC counter, which keeps running through deep sleep). Full power loss
//! clears the magic and everything resets.
//!
//! Access is single-threaded by construction: the engine reads once at boot
//! and writes at most once before suspend, so the raw-pointer accessors
//! below never race.

use inkcycle_core::cycle::CycleCell;
use inkcycle_core::engine::{IntegrityToken, MAX_TOKEN_LEN};

const SURVIVAL_MAGIC: u32 = 0xB007_C1C3;

#[repr(C)]
struct SurvivalState {
    magic: u32,
    /// The engine's persisted cycle cell (retry counter or carousel index).
    cycle_cell: u8,
    token_len: u8,
    token: [u8; MAX_TOKEN_LEN],
    /// Unix epoch minus the RTC counter at sync time; 0 = never synced.
    epoch_offset: u64,
}

impl SurvivalState {
    const fn new() -> Self {
        Self {
            magic: 0,
            cycle_cell: 0,
            token_len: 0,
            token: [0; MAX_TOKEN_LEN],
            epoch_offset: 0,
        }
    }
}

#[esp_hal::ram(unstable(rtc_fast))]
static mut SURVIVAL: SurvivalState = SurvivalState::new();

/// Validate the block at boot. Returns true if state survived suspension;
/// on a cold boot the block is zeroed and stamped.
pub fn validate_or_reset() -> bool {
    unsafe {
        let state = &raw mut SURVIVAL;
        if (*state).magic == SURVIVAL_MAGIC {
            return true;
        }
        *state = SurvivalState::new();
        (*state).magic = SURVIVAL_MAGIC;
        false
    }
}

/// The engine's persisted cell, backed by the survival block.
pub struct RtcCell;

impl CycleCell for RtcCell {
    fn load(&mut self) -> u8 {
        unsafe { (*(&raw const SURVIVAL)).cycle_cell }
    }

    fn store(&mut self, value: u8) {
        unsafe {
            (*(&raw mut SURVIVAL)).cycle_cell = value;
        }
    }
}

pub fn token_load() -> Option<IntegrityToken> {
    unsafe {
        let state = &raw const SURVIVAL;
        let len = (*state).token_len as usize;
        if len == 0 || len > MAX_TOKEN_LEN {
            return None;
        }
        core::str::from_utf8(&(*state).token[..len])
            .ok()
            .map(IntegrityToken::new)
    }
}

pub fn token_store(token: &IntegrityToken) {
    let bytes = token.as_str().as_bytes();
    unsafe {
        let state = &raw mut SURVIVAL;
        (*state).token = [0; MAX_TOKEN_LEN];
        (*state).token[..bytes.len()].copy_from_slice(bytes);
        (*state).token_len = bytes.len() as u8;
    }
}

pub fn token_clear() {
    unsafe {
        (*(&raw mut SURVIVAL)).token_len = 0;
    }
}

/// Record a wall-clock sync: `epoch_secs` was current when the RTC counter
/// read `rtc_secs`.
pub fn epoch_record(epoch_secs: u64, rtc_secs: u64) {
    unsafe {
        (*(&raw mut SURVIVAL)).epoch_offset = epoch_secs.saturating_sub(rtc_secs);
    }
}

/// Current epoch seconds, if the clock has ever been synced.
pub fn epoch_now(rtc_secs: u64) -> Option<u64> {
    let offset = unsafe { (*(&raw const SURVIVAL)).epoch_offset };
    if offset == 0 {
        return None;
    }
    Some(offset + rtc_secs)
}
