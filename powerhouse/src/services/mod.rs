//! Per-session services spawned through lockdown's `StartService`

pub mod diagnostics_relay;
