//! Media Watchdog
//!
//! Tracks configured capture tools, correlates them with camera and
//! microphone usage, and enforces per-process runtime budgets.

pub mod actions;
pub mod clock;
pub mod config;
pub mod controller;
pub mod events;
pub mod logger;
pub mod media;
pub mod notification;
pub mod registry;
pub mod scheduler;
pub mod sys;
pub mod watchdog;

#[cfg(test)]
mod testing;
