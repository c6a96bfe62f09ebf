//! Wake-cycle decision engine for a battery-powered e-paper frame.
//!
//! The device spends nearly all of its life in deep sleep. Once per wake it
//! loads its configuration, decides which image slot to show, whether a cheap
//! integrity check may replace the full fetch, and exactly how long to sleep
//! afterwards. Everything in this crate is platform-free; the firmware binary
//! implements the collaborator traits in [`engine`] against real hardware.

#![no_std]

pub mod battery;
pub mod config;
pub mod cycle;
pub mod decision;
pub mod engine;
pub mod schedule;
pub mod time;
pub mod wake;
