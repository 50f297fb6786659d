//! fleetsync library
//!
//! Directory synchronization between local trees and remote daemon
//! instances. The client drives reconciliation (scan, compare, act); the
//! daemon exports named, credentialed subtrees over a framed TCP protocol.

pub mod access;
pub mod client;
pub mod compare;
pub mod config;
pub mod daemon;
pub mod fsutil;
pub mod logger;
pub mod protocol;
pub mod scanner;
pub mod url;
