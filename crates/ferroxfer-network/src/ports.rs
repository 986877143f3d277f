//! Listening port selection for active mode

use parking_lot::Mutex;
use rand::Rng;
use tracing::trace;

/// Cursor over a restricted port range
///
/// The first allocation starts at a random port of the range; later ones
/// continue where the previous one stopped, so consecutive transfers do
/// not keep reusing the same port.
#[derive(Debug, Default)]
pub struct PortAllocator {
    cursor: Mutex<Option<u16>>,
}

impl PortAllocator {
    /// Fresh allocator
    pub fn new() -> Self {
        Self::default()
    }

    /// Try every port of `[low, high]` until `attempt` succeeds
    ///
    /// `low` is clamped to `high` when the range is inverted.
    pub fn try_ports<T>(
        &self,
        low: u16,
        high: u16,
        mut attempt: impl FnMut(u16) -> Option<T>,
    ) -> Option<T> {
        let low = low.min(high);
        let mut cursor = self.cursor.lock();
        let mut port = match *cursor {
            Some(port) if (low..=high).contains(&port) => port,
            _ => rand::thread_rng().gen_range(low..=high),
        };

        let count = u32::from(high - low) + 1;
        for _ in 0..count {
            let current = port;
            port = if port >= high { low } else { port + 1 };
            *cursor = Some(port);
            if let Some(found) = attempt(current) {
                return Some(found);
            }
            trace!(port = current, "Port unavailable");
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn test_tries_whole_range_once() {
        let allocator = PortAllocator::new();
        let mut seen = Vec::new();
        let result: Option<()> = allocator.try_ports(6000, 6009, |port| {
            seen.push(port);
            None
        });
        assert!(result.is_none());
        assert_eq!(seen.len(), 10);
        assert_eq!(seen.iter().copied().collect::<HashSet<_>>().len(), 10);
        assert!(seen.iter().all(|p| (6000..=6009).contains(p)));
        // Sequential with wrap around
        for pair in seen.windows(2) {
            assert!(pair[1] == pair[0] + 1 || (pair[0] == 6009 && pair[1] == 6000));
        }
    }

    #[test]
    fn test_continues_after_last_port() {
        let allocator = PortAllocator::new();
        let first = allocator.try_ports(7000, 7100, Some).unwrap();
        let second = allocator.try_ports(7000, 7100, Some).unwrap();
        assert_eq!(second, if first == 7100 { 7000 } else { first + 1 });
    }

    #[test]
    fn test_inverted_range_uses_high() {
        let allocator = PortAllocator::new();
        assert_eq!(allocator.try_ports(9000, 8000, Some), Some(8000));
        assert_eq!(allocator.try_ports(9000, 8000, Some), Some(8000));
    }

    #[test]
    fn test_restarts_when_range_changes() {
        let allocator = PortAllocator::new();
        allocator.try_ports(1000, 1000, Some).unwrap();
        let port = allocator.try_ports(2000, 2005, Some).unwrap();
        assert!((2000..=2005).contains(&port));
    }

    #[test]
    fn test_full_u16_range() {
        let allocator = PortAllocator::new();
        let mut calls = 0u32;
        let found = allocator.try_ports(1, u16::MAX, |port| {
            calls += 1;
            (calls == 3).then_some(port)
        });
        assert!(found.is_some());
        assert_eq!(calls, 3);
    }

    proptest! {
        #[test]
        fn prop_every_port_tried_once(low in 1u16..2000, span in 0u16..300, rounds in 1usize..4) {
            let high = low + span;
            let allocator = PortAllocator::new();
            for _ in 0..rounds {
                let mut seen = HashSet::new();
                let found: Option<()> = allocator.try_ports(low, high, |port| {
                    assert!((low..=high).contains(&port));
                    seen.insert(port);
                    None
                });
                prop_assert!(found.is_none());
                prop_assert_eq!(seen.len(), usize::from(span) + 1);
            }
        }
    }
}
