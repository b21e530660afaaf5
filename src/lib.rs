//! Relay text-channel messages into a Discord voice channel as speech.
//!
//! Message → [`ingest`] filter → [`queue`] → [`tts`] synthesis →
//! [`transcode`] → [`voice`] player. The Discord adapter lives behind the
//! `discord` feature; everything else is platform-neutral.

pub mod config;
pub mod error;
pub mod health;
pub mod ingest;
pub mod queue;
pub mod transcode;
pub mod tts;
pub mod voice;

#[cfg(feature = "discord")]
pub mod discord;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a std mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
