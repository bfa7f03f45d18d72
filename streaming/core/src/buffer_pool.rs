// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::buffer::{BufferRecycler, Segment, TupleBuffer, UNPOOLED_SEGMENT_INDEX};
use crate::context::Context;
use crate::error::EngineResult;

/// Hands out buffers to operators and sources. Implemented by the global
/// [`BufferManager`] and by [`LocalBufferPool`] reservations.
pub trait BufferProvider: Send + Sync {
    /// Waits indefinitely for a buffer.
    fn get_buffer_blocking(&self) -> TupleBuffer;

    /// Returns `None` when no buffer became available before the deadline.
    fn get_buffer_with_timeout(&self, timeout: Duration) -> Option<TupleBuffer>;

    /// Non-blocking variant.
    fn try_get_buffer(&self) -> Option<TupleBuffer>;

    /// Size in bytes of the buffers this provider hands out.
    fn buffer_size(&self) -> usize;
}

/// Global pool of fixed-size buffer segments backed by a pre-allocated arena,
/// plus an on-demand unpooled allocator for arbitrary sizes.
#[derive(Clone)]
pub struct BufferManager {
    inner: Arc<BufferManagerInner>,
}

pub(crate) struct BufferManagerInner {
    context: Arc<Context>,
    segments: Vec<Arc<Segment>>,
    free: Mutex<Vec<u32>>,
    available: Condvar,
}

impl BufferManager {
    pub fn new(context: Arc<Context>) -> EngineResult<Self> {
        let buffer_size = context.parameters.buffer_size_bytes;
        let pool_buffers = context.parameters.global_pool_buffers;
        let mut segments = Vec::with_capacity(pool_buffers);
        for index in 0..pool_buffers {
            segments.push(Arc::new(Segment::new(buffer_size, index as u32)?));
        }
        let inner = Arc::new(BufferManagerInner {
            context,
            segments,
            free: Mutex::new((0..pool_buffers as u32).rev().collect()),
            available: Condvar::new(),
        });
        let inner_dyn: Arc<dyn BufferRecycler> = inner.clone();
        let recycler: Weak<dyn BufferRecycler> = Arc::downgrade(&inner_dyn);
        for segment in &inner.segments {
            segment.set_home_recycler(recycler.clone());
        }
        inner
            .context
            .metrics
            .node_metrics
            .buffers_available
            .set(pool_buffers as i64);
        debug!(
            "Buffer manager initialized with {} buffers of {} bytes",
            pool_buffers, buffer_size
        );
        Ok(Self { inner })
    }

    /// Allocates a buffer of arbitrary size outside the pool. The memory is
    /// freed (and the live counter decremented) on final release.
    pub fn get_unpooled_buffer(&self, size: usize) -> EngineResult<TupleBuffer> {
        let segment = Arc::new(Segment::new(size, UNPOOLED_SEGMENT_INDEX)?);
        let inner_dyn: Arc<dyn BufferRecycler> = self.inner.clone();
        let recycler: Weak<dyn BufferRecycler> = Arc::downgrade(&inner_dyn);
        segment.set_home_recycler(recycler);
        let metrics = &self.inner.context.metrics.node_metrics;
        metrics.unpooled_buffers_live.inc();
        metrics.buffers_acquired.inc();
        Ok(segment.into_handle())
    }

    /// Number of buffers currently in the global free list.
    pub fn available_buffers(&self) -> usize {
        self.inner.free.lock().len()
    }

    /// Takes `count` segments out of the pool for a local reservation,
    /// blocking until enough are free.
    fn reserve_segments(&self, count: usize) -> Vec<Arc<Segment>> {
        let mut reserved = Vec::with_capacity(count);
        let mut free = self.inner.free.lock();
        while reserved.len() < count {
            match free.pop() {
                Some(index) => reserved.push(self.inner.segments[index as usize].clone()),
                None => self.inner.available.wait(&mut free),
            }
        }
        self.inner
            .context
            .metrics
            .node_metrics
            .buffers_available
            .set(free.len() as i64);
        reserved
    }

    fn pop_free(&self) -> Option<Arc<Segment>> {
        let mut free = self.inner.free.lock();
        let index = free.pop()?;
        self.inner
            .context
            .metrics
            .node_metrics
            .buffers_available
            .set(free.len() as i64);
        Some(self.inner.segments[index as usize].clone())
    }

    pub(crate) fn context(&self) -> &Arc<Context> {
        &self.inner.context
    }
}

impl BufferProvider for BufferManager {
    fn get_buffer_blocking(&self) -> TupleBuffer {
        let segment = {
            let mut free = self.inner.free.lock();
            loop {
                if let Some(index) = free.pop() {
                    break self.inner.segments[index as usize].clone();
                }
                self.inner.available.wait(&mut free);
            }
        };
        let metrics = &self.inner.context.metrics.node_metrics;
        metrics.buffers_acquired.inc();
        metrics.buffers_available.dec();
        segment.into_handle()
    }

    fn get_buffer_with_timeout(&self, timeout: Duration) -> Option<TupleBuffer> {
        let deadline = Instant::now() + timeout;
        let segment = {
            let mut free = self.inner.free.lock();
            loop {
                if let Some(index) = free.pop() {
                    break self.inner.segments[index as usize].clone();
                }
                if self.inner.available.wait_until(&mut free, deadline).timed_out() {
                    return None;
                }
            }
        };
        let metrics = &self.inner.context.metrics.node_metrics;
        metrics.buffers_acquired.inc();
        metrics.buffers_available.dec();
        Some(segment.into_handle())
    }

    fn try_get_buffer(&self) -> Option<TupleBuffer> {
        let segment = self.pop_free()?;
        self.inner.context.metrics.node_metrics.buffers_acquired.inc();
        Some(segment.into_handle())
    }

    fn buffer_size(&self) -> usize {
        self.inner.context.parameters.buffer_size_bytes
    }
}

impl BufferRecycler for BufferManagerInner {
    fn recycle(&self, segment: &Arc<Segment>) {
        let metrics = &self.context.metrics.node_metrics;
        metrics.buffers_recycled.inc();
        if segment.index == UNPOOLED_SEGMENT_INDEX {
            metrics.unpooled_buffers_live.dec();
            return;
        }
        let mut free = self.free.lock();
        free.push(segment.index);
        metrics.buffers_available.set(free.len() as i64);
        drop(free);
        self.available.notify_one();
    }
}

/// Reserves a fixed number of segments from the global pool for one consumer
/// (a worker thread or a source) so operators cannot starve each other.
///
/// Dropping the pool flips it to draining: free segments go back to the
/// global pool immediately, outstanding ones as their refcounts drain.
#[derive(Clone)]
pub struct LocalBufferPool {
    inner: Arc<LocalBufferPoolInner>,
}

struct LocalBufferPoolInner {
    manager: BufferManager,
    free: Mutex<Vec<Arc<Segment>>>,
    available: Condvar,
}

impl LocalBufferPool {
    pub fn new(manager: &BufferManager, buffers: usize) -> Self {
        let reserved = manager.reserve_segments(buffers);
        let inner = Arc::new(LocalBufferPoolInner {
            manager: manager.clone(),
            free: Mutex::new(reserved),
            available: Condvar::new(),
        });
        let inner_dyn: Arc<dyn BufferRecycler> = inner.clone();
        let recycler: Weak<dyn BufferRecycler> = Arc::downgrade(&inner_dyn);
        for segment in inner.free.lock().iter() {
            segment.set_recycler(recycler.clone());
        }
        Self { inner }
    }

    fn checkout(&self, segment: Arc<Segment>) -> TupleBuffer {
        self.inner
            .manager
            .context()
            .metrics
            .node_metrics
            .buffers_acquired
            .inc();
        segment.into_handle()
    }
}

impl BufferProvider for LocalBufferPool {
    fn get_buffer_blocking(&self) -> TupleBuffer {
        let segment = {
            let mut free = self.inner.free.lock();
            loop {
                if let Some(segment) = free.pop() {
                    break segment;
                }
                self.inner.available.wait(&mut free);
            }
        };
        self.checkout(segment)
    }

    fn get_buffer_with_timeout(&self, timeout: Duration) -> Option<TupleBuffer> {
        let deadline = Instant::now() + timeout;
        let segment = {
            let mut free = self.inner.free.lock();
            loop {
                if let Some(segment) = free.pop() {
                    break segment;
                }
                if self.inner.available.wait_until(&mut free, deadline).timed_out() {
                    return None;
                }
            }
        };
        Some(self.checkout(segment))
    }

    fn try_get_buffer(&self) -> Option<TupleBuffer> {
        let segment = self.inner.free.lock().pop()?;
        Some(self.checkout(segment))
    }

    fn buffer_size(&self) -> usize {
        self.inner.manager.buffer_size()
    }
}

impl BufferRecycler for LocalBufferPoolInner {
    fn recycle(&self, segment: &Arc<Segment>) {
        self.manager
            .context()
            .metrics
            .node_metrics
            .buffers_recycled
            .inc();
        self.free.lock().push(segment.clone());
        self.available.notify_one();
    }
}

/// Destruction is deferred for outstanding buffers: free segments return to
/// the global pool here, while buffers still referenced elsewhere fall back
/// to the segment's home recycler once their refcount drains (their weak
/// reference to this pool no longer upgrades).
impl Drop for LocalBufferPoolInner {
    fn drop(&mut self) {
        let manager_inner_dyn: Arc<dyn BufferRecycler> = self.manager.inner.clone();
        let global: Weak<dyn BufferRecycler> = Arc::downgrade(&manager_inner_dyn);
        for segment in self.free.lock().drain(..) {
            segment.set_recycler(global.clone());
            self.manager.inner.recycle(&segment);
        }
    }
}
