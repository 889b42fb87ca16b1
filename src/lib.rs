//! An engine for AT-command conversations with serial modems.
//!
//! Commands, unsolicited result codes and scripted multi-step works are
//! multiplexed over one duplex byte stream. See [`engine::AtEngine`] for the
//! poll-driven core and [`client::AtClient`] for the blocking shell on top.

#![no_std]

pub mod client;
pub mod engine;
pub mod error;
#[cfg(feature = "std")]
pub mod fake_modem;
pub mod parse;
pub mod response;
pub mod transport;
pub mod urc;
pub mod work;

pub type Result<T> = core::result::Result<T, error::Error>;

#[cfg(all(target_abi = "eabihf", target_os = "none"))]
pub type RawMutex = embassy_sync::blocking_mutex::raw::ThreadModeRawMutex;
#[cfg(not(all(target_abi = "eabihf", target_os = "none")))]
pub type RawMutex = embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
