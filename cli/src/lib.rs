//! Cage CLI - provisions container rootfs volumes and runtime specs.

pub mod commands;
pub mod output;
