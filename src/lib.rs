//! Hierarchical timing wheel, multilevel LRU, incrementally-rehashing
//! dictionary, and waiter-queue mutex/condvar primitives.
//!
//! Each module is self-contained and can be used independently; the
//! dictionary is the only consumer that composes another module
//! (`lru`) internally.

pub mod clock;
pub mod config;
pub mod dict;
pub mod error;
pub mod lru;
pub mod mutex;
pub mod slot;
pub mod timer;

pub use config::{DictOptions, EvictPolicy, LruOptions, TimerWheelOptions};
pub use dict::{ByteSize, DictNumeric, MultiDict};
pub use error::{CoreError, CoreResult};
pub use lru::{LruPtr, MultiLru};
pub use mutex::{WaiterCond, WaiterMutex};
pub use slot::{Inserted, SlotBackend, VecSlot};
pub use timer::{TimerId, TimerWheel};
