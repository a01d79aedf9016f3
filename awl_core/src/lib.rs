//! # AWL Core
//!
//! Foundational mechanisms for the wireless audio streaming workspace:
//! the setup-time memory pool, the refcounted node queue system shared
//! between the foreground loop and I/O interrupt contexts, and the
//! CRC-4/ITU used by the on-wire audio header.

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

pub mod crc4;
pub mod mem_pool;
pub mod queue;

pub use crc4::crc4_itu;
pub use mem_pool::MemPool;
pub use queue::{CriticalCfg, NodeBank, NodeId, QueueId, QueueStats};
