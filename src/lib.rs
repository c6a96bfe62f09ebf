#![no_std]

extern crate alloc;

pub mod display;
pub mod http;
pub mod net;
pub mod panel;
pub mod rtcmem;
pub mod storage;
