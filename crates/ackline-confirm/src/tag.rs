// Delivery tags and the per-session allocator that mirrors broker numbering.
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Per-channel identifier the broker uses to correlate confirms with publishes.
///
/// Tags start at 1 when a channel enters confirm mode and are never reused
/// within that channel session.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct DeliveryTag(u64);

impl DeliveryTag {
    pub const FIRST: DeliveryTag = DeliveryTag(1);

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    // The tag immediately after this one; used as the split point for multi-acks.
    pub(crate) fn successor(&self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl From<u64> for DeliveryTag {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hands out strictly increasing delivery tags without gaps.
///
/// The broker assigns tags to published messages on its side; the allocator
/// must produce the same sequence so that confirms can be matched to pending
/// entries. Seed it with the channel's next publish sequence number.
///
/// ```
/// use ackline_confirm::{DeliveryTag, SequenceAllocator};
///
/// let allocator = SequenceAllocator::new();
/// assert_eq!(allocator.next(), DeliveryTag::new(1));
/// assert_eq!(allocator.next(), DeliveryTag::new(2));
/// assert_eq!(allocator.last_issued(), Some(DeliveryTag::new(2)));
/// ```
#[derive(Debug)]
pub struct SequenceAllocator {
    next: AtomicU64,
}

impl SequenceAllocator {
    pub fn new() -> Self {
        Self::starting_at(DeliveryTag::FIRST)
    }

    pub fn starting_at(first: DeliveryTag) -> Self {
        // Tag 0 is reserved by the protocol; clamp so a fresh session still starts at 1.
        Self {
            next: AtomicU64::new(first.value().max(1)),
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn next(&self) -> DeliveryTag {
        DeliveryTag(self.next.fetch_add(1, Ordering::AcqRel))
    }

    /// The most recently issued tag, or `None` before the first `next()`.
    pub fn last_issued(&self) -> Option<DeliveryTag> {
        let next = self.next.load(Ordering::Acquire);
        (next > 1).then(|| DeliveryTag(next - 1))
    }

    /// The tag the next call to `next()` will return.
    pub fn peek(&self) -> DeliveryTag {
        DeliveryTag(self.next.load(Ordering::Acquire))
    }
}

impl Default for SequenceAllocator {
    fn default() -> Self {
        Self::new()
    }
}
