//! Connectivity tracking and background reconciliation.
//!
//! - [`manager`]: online/offline state, reconnect and periodic passes

pub mod manager;
