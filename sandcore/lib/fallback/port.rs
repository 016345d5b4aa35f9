//! Port allocation for fallback servers.

use std::collections::HashSet;

use tokio::sync::Mutex;

use crate::{config::PortRange, SandcoreError, SandcoreResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Hands out unique TCP ports from a bounded range.
///
/// The search starts right after the last port handed out and wraps around at the end of the
/// range, skipping ports that are still outstanding. A released port is therefore only handed out
/// again once the cursor has come back around to it.
#[derive(Debug)]
pub struct PortAllocator {
    range: PortRange,
    state: Mutex<AllocatorState>,
}

#[derive(Debug)]
struct AllocatorState {
    next: u16,
    outstanding: HashSet<u16>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl PortAllocator {
    /// Creates an allocator over `range`.
    pub fn new(range: PortRange) -> Self {
        Self {
            range,
            state: Mutex::new(AllocatorState {
                next: range.start(),
                outstanding: HashSet::new(),
            }),
        }
    }

    /// The managed range.
    pub fn range(&self) -> PortRange {
        self.range
    }

    /// Reserves a port that is not currently outstanding.
    pub async fn allocate(&self) -> SandcoreResult<u16> {
        let mut state = self.state.lock().await;

        for _ in 0..self.range.len() {
            let port = state.next;
            state.next = if port >= self.range.end() {
                self.range.start()
            } else {
                port + 1
            };

            if state.outstanding.insert(port) {
                tracing::debug!(port, "allocated fallback port");
                return Ok(port);
            }
        }

        Err(SandcoreError::PortRangeExhausted {
            start: self.range.start(),
            end: self.range.end(),
        })
    }

    /// Returns `port` to the pool. Ports outside the range are ignored.
    pub async fn release(&self, port: u16) {
        if !self.range.contains(port) {
            return;
        }

        if self.state.lock().await.outstanding.remove(&port) {
            tracing::debug!(port, "released fallback port");
        }
    }

    /// Whether `port` is currently handed out.
    pub async fn is_allocated(&self, port: u16) -> bool {
        self.state.lock().await.outstanding.contains(&port)
    }

    /// The number of ports currently handed out.
    pub async fn outstanding(&self) -> usize {
        self.state.lock().await.outstanding.len()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn allocator(start: u16, end: u16) -> PortAllocator {
        PortAllocator::new(PortRange::new(start, end).unwrap())
    }

    #[tokio::test]
    async fn test_allocates_sequentially() -> anyhow::Result<()> {
        let allocator = allocator(40000, 40010);
        assert_eq!(allocator.allocate().await?, 40000);
        assert_eq!(allocator.allocate().await?, 40001);
        assert_eq!(allocator.allocate().await?, 40002);
        assert_eq!(allocator.outstanding().await, 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_exhaustion_and_release() -> anyhow::Result<()> {
        let allocator = allocator(45000, 45002);
        for expected in 45000..=45002 {
            assert_eq!(allocator.allocate().await?, expected);
        }

        assert!(matches!(
            allocator.allocate().await,
            Err(SandcoreError::PortRangeExhausted {
                start: 45000,
                end: 45002
            })
        ));

        allocator.release(45001).await;
        assert!(!allocator.is_allocated(45001).await);
        assert_eq!(allocator.allocate().await?, 45001);
        Ok(())
    }

    #[tokio::test]
    async fn test_released_port_reused_only_after_wrap() -> anyhow::Result<()> {
        let allocator = allocator(46000, 46003);
        let first = allocator.allocate().await?;
        assert_eq!(first, 46000);
        allocator.release(first).await;

        // The cursor moves on before coming back to the released port.
        assert_eq!(allocator.allocate().await?, 46001);
        assert_eq!(allocator.allocate().await?, 46002);
        assert_eq!(allocator.allocate().await?, 46003);
        assert_eq!(allocator.allocate().await?, 46000);
        Ok(())
    }

    #[tokio::test]
    async fn test_release_outside_range_is_noop() -> anyhow::Result<()> {
        let allocator = allocator(47000, 47001);
        allocator.allocate().await?;
        allocator.release(80).await;
        allocator.release(47005).await;
        assert_eq!(allocator.outstanding().await, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_range_ending_at_max_port() -> anyhow::Result<()> {
        let allocator = allocator(u16::MAX - 1, u16::MAX);
        assert_eq!(allocator.allocate().await?, u16::MAX - 1);
        assert_eq!(allocator.allocate().await?, u16::MAX);
        allocator.release(u16::MAX - 1).await;
        assert_eq!(allocator.allocate().await?, u16::MAX - 1);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_allocations_are_unique() -> anyhow::Result<()> {
        let allocator = Arc::new(allocator(50000, 50100));
        let handles: Vec<_> = (0..50)
            .map(|_| {
                let allocator = allocator.clone();
                tokio::spawn(async move { allocator.allocate().await })
            })
            .collect();

        let mut ports = HashSet::new();
        for handle in handles {
            let port = handle.await??;
            assert!((50000..=50100).contains(&port));
            assert!(ports.insert(port), "port {port} handed out twice");
        }
        assert_eq!(ports.len(), 50);
        Ok(())
    }
}
