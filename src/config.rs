//! Runtime option structs (§6 of the design).
//!
//! These are plain `Default`-able structs in the style of the event
//! loop's `policy` module: small, cheap to clone, carrying the documented
//! defaults so callers only override what they need.

/// Eviction strategy used by [`crate::dict::MultiDict`] once `max_memory`
/// is exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvictPolicy {
    #[default]
    None,
    Lru,
    Random,
}

/// Tunables for [`crate::dict::MultiDict`].
#[derive(Debug, Clone)]
pub struct DictOptions {
    /// Percent fill (`count*100/size`) that triggers expansion under the
    /// count-based policy. Default 200 (2x fill).
    pub expand_load_factor: u8,
    /// Percent fill below which the table is eligible to shrink.
    pub shrink_load_factor: u8,
    /// Target average bytes per used slot for the byte-based policy.
    pub target_slot_bytes: u64,
    /// Safeguard ceiling on the single largest slot's bytes.
    pub max_slot_bytes: u64,
    /// Opt into the byte-based expansion heuristic instead of pure count.
    pub use_byte_based_expand: bool,
    /// Whether incremental rehash may be triggered automatically at all.
    pub auto_resize: bool,
    /// User-byte budget (`key_bytes + val_bytes`); 0 = unlimited.
    pub max_memory: u64,
    pub evict_policy: EvictPolicy,
}

impl Default for DictOptions {
    fn default() -> Self {
        Self {
            expand_load_factor: 200,
            shrink_load_factor: 10,
            target_slot_bytes: 2 * 1024 * 1024,
            max_slot_bytes: 8 * 1024 * 1024,
            use_byte_based_expand: false,
            auto_resize: true,
            max_memory: 0,
            evict_policy: EvictPolicy::None,
        }
    }
}

/// Tunables for [`crate::lru::MultiLru`].
#[derive(Debug, Clone, Copy)]
pub struct LruOptions {
    /// Number of priority levels. Practical maximum is 63 given the
    /// sentinel layout (see [`crate::lru::MultiLru::new`]).
    pub max_levels: u8,
    /// Initial entry-array capacity, rounded up to the allocator's size
    /// class by the implementation.
    pub start_capacity: usize,
}

impl Default for LruOptions {
    fn default() -> Self {
        Self {
            max_levels: 8,
            start_capacity: 1024,
        }
    }
}

/// The timer wheel's shape is hard-coded (branch-free arithmetic is the
/// point), so this is a set of associated constants rather than a
/// `Default` struct — there is nothing to configure.
pub struct TimerWheelOptions;

impl TimerWheelOptions {
    /// Resolution of wheel 0, and of the pending queue's granularity.
    pub const RESOLUTION_US: u64 = 1_000;
    /// Slot counts for `W[0..4]`.
    pub const WHEEL_SIZES: [u32; 4] = [256, 64, 64, 64];
}
