// Copyright 2025 eraflo
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Transient linear upload memory.
//!
//! The [`UploadAllocator`] bump-allocates CPU-written, GPU-read bytes out of
//! fixed-size pages. There is no individual free: a page rotated out is
//! returned to the shared [`UploadPagePool`] once the submission that used
//! it completes.
//!
//! ```text
//! page A: [alloc][alloc][alloc|  no room  ]  -> rotated out, retired
//! page B: [alloc][ cursor ->              ]
//! oversize request ----------------------->  dedicated buffer, ring untouched
//! ```

use crate::deletion_queue::{DeferredDeletionQueue, DeferredPayload};
use crate::handle::DeviceHandle;
use bytemuck::Pod;
use ferrite_core::rhi::{BufferId, QueueType, RhiError, RhiResult};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// A range of upload memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadAllocation {
    /// The backing buffer.
    pub buffer: BufferId,
    /// Byte offset of the range in the buffer.
    pub offset: u64,
    /// Byte size of the range.
    pub size: u64,
    /// Whether the range owns a dedicated buffer instead of a shared page.
    pub dedicated: bool,
}

impl UploadAllocation {
    /// Copies `data` to the start of the range.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if `data` is larger than the range.
    pub fn write(&self, device: &DeviceHandle, data: &[u8]) -> RhiResult<()> {
        if data.len() as u64 > self.size {
            return Err(RhiError::InvalidArgument(format!(
                "writing {} bytes into an upload range of {}",
                data.len(),
                self.size
            )));
        }
        device.native().write_buffer(self.buffer, self.offset, data)
    }

    /// Copies a plain-old-data value to the start of the range.
    pub fn write_pod<T: Pod>(&self, device: &DeviceHandle, value: &T) -> RhiResult<()> {
        self.write(device, bytemuck::bytes_of(value))
    }

    /// Copies a slice of plain-old-data values to the start of the range.
    pub fn write_slice<T: Pod>(&self, device: &DeviceHandle, values: &[T]) -> RhiResult<()> {
        self.write(device, bytemuck::cast_slice(values))
    }
}

/// Device-wide pool of fixed-size upload pages.
#[derive(Debug)]
pub struct UploadPagePool {
    device: Arc<DeviceHandle>,
    page_size: u64,
    max_pooled: usize,
    free_pages: Mutex<Vec<BufferId>>,
    pages_created: AtomicUsize,
}

impl UploadPagePool {
    /// Creates an empty pool sized from the device settings.
    pub fn new(device: Arc<DeviceHandle>) -> Arc<Self> {
        let page_size = device.settings().upload_page_size;
        let max_pooled = device.settings().max_pooled_upload_pages;
        Arc::new(Self {
            device,
            page_size,
            max_pooled,
            free_pages: Mutex::new(Vec::new()),
            pages_created: AtomicUsize::new(0),
        })
    }

    /// Size of every page in bytes.
    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    /// Pops an idle page or creates one.
    pub fn acquire(&self) -> RhiResult<BufferId> {
        if let Some(page) = self.free_pages.lock().pop() {
            return Ok(page);
        }
        let page = self
            .device
            .native()
            .create_upload_buffer(self.page_size)
            .inspect_err(|e| log::error!("UploadPagePool: page creation failed: {e}"))?;
        let created = self.pages_created.fetch_add(1, Ordering::Relaxed) + 1;
        log::debug!(
            "UploadPagePool: created page {page:?} ({} bytes, {created} total)",
            self.page_size
        );
        Ok(page)
    }

    /// Returns a page the GPU is done with. Pages beyond the pool cap are destroyed.
    pub fn release(&self, page: BufferId) {
        let mut free = self.free_pages.lock();
        if free.len() < self.max_pooled {
            free.push(page);
        } else {
            drop(free);
            self.device.native().destroy_buffer(page);
        }
    }

    /// Idle pages.
    pub fn pooled_count(&self) -> usize {
        self.free_pages.lock().len()
    }

    /// Pages created since startup.
    pub fn pages_created(&self) -> usize {
        self.pages_created.load(Ordering::Relaxed)
    }
}

impl Drop for UploadPagePool {
    fn drop(&mut self) {
        for page in self.free_pages.get_mut().drain(..) {
            self.device.native().destroy_buffer(page);
        }
    }
}

/// A per-context linear allocator over upload pages.
#[derive(Debug)]
pub struct UploadAllocator {
    pool: Arc<UploadPagePool>,
    current: Option<BufferId>,
    cursor: u64,
    retired_pages: Vec<BufferId>,
    dedicated: Vec<BufferId>,
}

impl UploadAllocator {
    /// Creates an allocator. The first page is taken on the first allocation.
    pub fn new(pool: Arc<UploadPagePool>) -> Self {
        Self {
            pool,
            current: None,
            cursor: 0,
            retired_pages: Vec::new(),
            dedicated: Vec::new(),
        }
    }

    /// Allocates `size` bytes aligned to `alignment`.
    ///
    /// Requests that do not fit in the rest of the current page rotate to a
    /// fresh page and start at offset zero. Requests larger than a page get a
    /// dedicated buffer and leave the ring cursor untouched.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for a zero size or an alignment that is not a
    /// power of two, and propagates buffer creation failures.
    pub fn allocate(&mut self, size: u64, alignment: u64) -> RhiResult<UploadAllocation> {
        if size == 0 {
            return Err(RhiError::InvalidArgument(
                "upload allocations must be non-empty".to_string(),
            ));
        }
        if !alignment.is_power_of_two() {
            return Err(RhiError::InvalidArgument(format!(
                "upload alignment {alignment} is not a power of two"
            )));
        }

        let page_size = self.pool.page_size();
        if size > page_size {
            return self.allocate_dedicated(size);
        }

        let aligned = self.cursor.next_multiple_of(alignment);
        let offset = match self.current {
            Some(_) if aligned + size <= page_size => aligned,
            _ => {
                self.rotate()?;
                0
            }
        };

        let buffer = self
            .current
            .ok_or_else(|| RhiError::exhausted("upload allocator has no page"))?;
        self.cursor = offset + size;
        Ok(UploadAllocation {
            buffer,
            offset,
            size,
            dedicated: false,
        })
    }

    fn rotate(&mut self) -> RhiResult<()> {
        let fresh = self.pool.acquire()?;
        if let Some(old) = self.current.replace(fresh) {
            self.retired_pages.push(old);
        }
        self.cursor = 0;
        Ok(())
    }

    fn allocate_dedicated(&mut self, size: u64) -> RhiResult<UploadAllocation> {
        let buffer = self
            .pool
            .device
            .native()
            .create_upload_buffer(size)
            .inspect_err(|e| log::error!("UploadAllocator: dedicated buffer failed: {e}"))?;
        log::debug!("UploadAllocator: dedicated {size}-byte buffer {buffer:?}");
        self.dedicated.push(buffer);
        Ok(UploadAllocation {
            buffer,
            offset: 0,
            size,
            dedicated: true,
        })
    }

    /// Current position in the current page.
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// The page allocations are currently served from.
    pub fn current_page(&self) -> Option<BufferId> {
        self.current
    }

    /// Pages and dedicated buffers waiting for the next submission.
    pub fn pending_retirements(&self) -> usize {
        self.retired_pages.len() + self.dedicated.len()
    }

    /// Hands rotated-out pages and dedicated buffers to the deletion queue,
    /// gated on the submission that last used them.
    pub fn retire(
        &mut self,
        queue: QueueType,
        fence_value: u64,
        deletion_queue: &DeferredDeletionQueue,
    ) {
        for page in self.retired_pages.drain(..) {
            let pool = Arc::clone(&self.pool);
            deletion_queue.enqueue(
                queue,
                fence_value,
                DeferredPayload::run(move || pool.release(page)),
            );
        }
        for buffer in self.dedicated.drain(..) {
            let device = Arc::clone(&self.pool.device);
            deletion_queue.enqueue(
                queue,
                fence_value,
                DeferredPayload::run(move || device.native().destroy_buffer(buffer)),
            );
        }
    }

    /// Retires everything, including the current page.
    pub fn release_all(
        &mut self,
        queue: QueueType,
        fence_value: u64,
        deletion_queue: &DeferredDeletionQueue,
    ) {
        if let Some(page) = self.current.take() {
            self.retired_pages.push(page);
        }
        self.cursor = 0;
        self.retire(queue, fence_value, deletion_queue);
    }
}
