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

//! CPU-only descriptor heap with per-segment coalescing free lists.

use crate::handle::DeviceHandle;
use ferrite_core::rhi::{
    CpuDescriptorHandle, DescriptorHeapDesc, DescriptorHeapKind, HeapInfo, OfflineHeapStats,
    RhiError, RhiResult,
};
use parking_lot::Mutex;
use std::sync::Arc;

/// A half-open range `[start, end)` of free slot indices in a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeRange {
    /// First free index.
    pub start: u32,
    /// One past the last free index.
    pub end: u32,
}

impl FreeRange {
    /// Number of slots in the range.
    pub fn len(&self) -> u32 {
        self.end - self.start
    }

    /// Whether the range holds no slot.
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// A descriptor handed out by an [`OfflineDescriptorHeap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OfflineDescriptor {
    /// CPU address of the slot.
    pub handle: CpuDescriptorHandle,
    /// Index of the segment the slot belongs to.
    pub segment_index: u32,
}

#[derive(Debug)]
struct Segment {
    info: HeapInfo,
    /// Sorted, non-overlapping, never adjacent.
    free_ranges: Vec<FreeRange>,
    in_use: u32,
}

impl Segment {
    fn new(info: HeapInfo) -> Self {
        Self {
            info,
            free_ranges: vec![FreeRange {
                start: 0,
                end: info.capacity,
            }],
            in_use: 0,
        }
    }

    fn pop(&mut self) -> Option<u32> {
        let head = self.free_ranges.first_mut()?;
        let index = head.start;
        head.start += 1;
        if head.is_empty() {
            self.free_ranges.remove(0);
        }
        self.in_use += 1;
        Some(index)
    }

    /// Returns `false` if `index` is already free.
    fn push(&mut self, index: u32) -> bool {
        let pos = self.free_ranges.partition_point(|r| r.start <= index);
        if pos > 0 && self.free_ranges[pos - 1].end > index {
            return false;
        }

        let joins_prev = pos > 0 && self.free_ranges[pos - 1].end == index;
        let joins_next = pos < self.free_ranges.len() && self.free_ranges[pos].start == index + 1;
        match (joins_prev, joins_next) {
            (true, true) => {
                self.free_ranges[pos - 1].end = self.free_ranges[pos].end;
                self.free_ranges.remove(pos);
            }
            (true, false) => self.free_ranges[pos - 1].end += 1,
            (false, true) => self.free_ranges[pos].start -= 1,
            (false, false) => self.free_ranges.insert(
                pos,
                FreeRange {
                    start: index,
                    end: index + 1,
                },
            ),
        }
        self.in_use -= 1;
        true
    }
}

/// A growable pool of CPU-only descriptors of one kind.
///
/// Storage is a list of fixed-capacity native segments. Allocation takes the
/// lowest free slot of the first segment with room and creates a new segment
/// when all are full, up to the configured cap. Freed slots are merged back
/// into their segment's free list, so freeing every slot leaves exactly one
/// full-capacity range per segment.
///
/// One lock guards the whole heap.
#[derive(Debug)]
pub struct OfflineDescriptorHeap {
    device: Arc<DeviceHandle>,
    kind: DescriptorHeapKind,
    segment_capacity: u32,
    max_segments: u32,
    segments: Mutex<Vec<Segment>>,
}

impl OfflineDescriptorHeap {
    /// Creates an empty heap sized from the device settings. Segments are created on demand.
    pub fn new(device: Arc<DeviceHandle>, kind: DescriptorHeapKind) -> Self {
        let settings = device.settings();
        let (segment_capacity, max_segments) = (
            settings.offline_segment_capacity,
            settings.max_offline_segments,
        );
        Self::with_capacity(device, kind, segment_capacity, max_segments)
    }

    /// Creates an empty heap with explicit segment sizing.
    pub fn with_capacity(
        device: Arc<DeviceHandle>,
        kind: DescriptorHeapKind,
        segment_capacity: u32,
        max_segments: u32,
    ) -> Self {
        debug_assert!(segment_capacity > 0 && max_segments > 0);
        Self {
            device,
            kind,
            segment_capacity,
            max_segments,
            segments: Mutex::new(Vec::new()),
        }
    }

    /// The kind of descriptors stored.
    pub fn kind(&self) -> DescriptorHeapKind {
        self.kind
    }

    pub(crate) fn device(&self) -> &Arc<DeviceHandle> {
        &self.device
    }

    /// Hands out one descriptor slot.
    ///
    /// # Errors
    ///
    /// - `ResourceCreationFailure` if a needed segment cannot be created.
    /// - `AllocationExhausted` if every segment is full and the heap is at its cap.
    pub fn allocate(&self) -> RhiResult<OfflineDescriptor> {
        let mut segments = self.segments.lock();

        for (segment_index, segment) in segments.iter_mut().enumerate() {
            if let Some(index) = segment.pop() {
                return Ok(OfflineDescriptor {
                    handle: segment.info.cpu_handle(index),
                    segment_index: segment_index as u32,
                });
            }
        }

        if segments.len() as u32 >= self.max_segments {
            log::warn!(
                "OfflineDescriptorHeap({:?}): all {} segments are full",
                self.kind,
                segments.len()
            );
            return Err(RhiError::exhausted(format!(
                "offline {:?} heap is at its cap of {} segments",
                self.kind, self.max_segments
            )));
        }

        let info = self
            .device
            .native()
            .create_descriptor_heap(&DescriptorHeapDesc {
                kind: self.kind,
                capacity: self.segment_capacity,
                shader_visible: false,
            })
            .inspect_err(|e| {
                log::error!("OfflineDescriptorHeap({:?}): segment creation failed: {e}", self.kind)
            })?;
        log::debug!(
            "OfflineDescriptorHeap({:?}): created segment {} ({} descriptors)",
            self.kind,
            segments.len(),
            self.segment_capacity
        );

        let segment_index = segments.len() as u32;
        let mut segment = Segment::new(info);
        let index = segment
            .pop()
            .ok_or_else(|| RhiError::exhausted("new offline segment has no capacity"))?;
        segments.push(segment);
        Ok(OfflineDescriptor {
            handle: info.cpu_handle(index),
            segment_index,
        })
    }

    /// Returns a slot to its segment's free list.
    ///
    /// # Errors
    ///
    /// Returns `InvalidHandle` if the handle is not part of the named segment,
    /// or if the slot is already free.
    pub fn free(&self, descriptor: OfflineDescriptor) -> RhiResult<()> {
        let mut segments = self.segments.lock();
        let segment = segments
            .get_mut(descriptor.segment_index as usize)
            .ok_or_else(|| {
                RhiError::InvalidHandle(format!(
                    "segment {} does not exist in the offline {:?} heap",
                    descriptor.segment_index, self.kind
                ))
            })?;
        let index = segment.info.index_of(descriptor.handle).ok_or_else(|| {
            RhiError::InvalidHandle(format!(
                "{:?} is outside segment {}",
                descriptor.handle, descriptor.segment_index
            ))
        })?;

        if !segment.push(index) {
            log::error!(
                "OfflineDescriptorHeap({:?}): double free of slot {index} in segment {}",
                self.kind,
                descriptor.segment_index
            );
            return Err(RhiError::InvalidHandle(format!(
                "{:?} is already free",
                descriptor.handle
            )));
        }
        Ok(())
    }

    /// Number of native segments created so far.
    pub fn segment_count(&self) -> usize {
        self.segments.lock().len()
    }

    /// Number of slots currently handed out.
    pub fn in_use(&self) -> usize {
        self.segments
            .lock()
            .iter()
            .map(|s| s.in_use as usize)
            .sum()
    }

    /// The free ranges of one segment, in order.
    pub fn free_ranges(&self, segment_index: usize) -> Vec<FreeRange> {
        self.segments
            .lock()
            .get(segment_index)
            .map(|s| s.free_ranges.clone())
            .unwrap_or_default()
    }

    /// A snapshot of the heap occupancy.
    pub fn stats(&self) -> OfflineHeapStats {
        let segments = self.segments.lock();
        OfflineHeapStats {
            kind: self.kind,
            segments: segments.len(),
            capacity: segments.len() * self.segment_capacity as usize,
            in_use: segments.iter().map(|s| s.in_use as usize).sum(),
        }
    }
}

impl Drop for OfflineDescriptorHeap {
    fn drop(&mut self) {
        for segment in self.segments.get_mut().drain(..) {
            if segment.in_use > 0 {
                log::debug!(
                    "OfflineDescriptorHeap({:?}): dropping segment with {} live descriptors",
                    self.kind,
                    segment.in_use
                );
            }
            self.device.native().destroy_descriptor_heap(segment.info.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::mock_handle;
    use ferrite_core::rhi::RhiSettings;

    fn heap(capacity: u32, max_segments: u32) -> OfflineDescriptorHeap {
        let (_mock, handle) = mock_handle(RhiSettings::default());
        OfflineDescriptorHeap::with_capacity(
            handle,
            DescriptorHeapKind::Resource,
            capacity,
            max_segments,
        )
    }

    #[test]
    fn test_allocation_is_lowest_slot_first() {
        let heap = heap(8, 1);
        let a = heap.allocate().unwrap();
        let b = heap.allocate().unwrap();
        assert_eq!(a.segment_index, 0);
        assert!(b.handle > a.handle);
        assert_eq!(heap.free_ranges(0), vec![FreeRange { start: 2, end: 8 }]);
    }

    #[test]
    fn test_free_all_in_arbitrary_order_coalesces() {
        let heap = heap(16, 1);
        let slots: Vec<_> = (0..16).map(|_| heap.allocate().unwrap()).collect();
        assert!(heap.free_ranges(0).is_empty());

        // A scattered order that exercises all four merge cases.
        for i in [5, 3, 4, 0, 15, 1, 2, 7, 9, 8, 6, 14, 10, 12, 11, 13] {
            heap.free(slots[i]).unwrap();
        }

        assert_eq!(heap.free_ranges(0), vec![FreeRange { start: 0, end: 16 }]);
        assert_eq!(heap.in_use(), 0);
    }

    #[test]
    fn test_ranges_stay_sorted_and_disjoint() {
        let heap = heap(10, 1);
        let slots: Vec<_> = (0..10).map(|_| heap.allocate().unwrap()).collect();
        for i in [8, 2, 5] {
            heap.free(slots[i]).unwrap();
        }
        assert_eq!(
            heap.free_ranges(0),
            vec![
                FreeRange { start: 2, end: 3 },
                FreeRange { start: 5, end: 6 },
                FreeRange { start: 8, end: 9 },
            ]
        );

        // Reallocation takes the lowest free slot again.
        let again = heap.allocate().unwrap();
        assert_eq!(again, slots[2]);
    }

    #[test]
    fn test_double_free_is_rejected() {
        let heap = heap(4, 1);
        let slot = heap.allocate().unwrap();
        heap.free(slot).unwrap();
        assert!(matches!(heap.free(slot), Err(RhiError::InvalidHandle(_))));
        assert_eq!(heap.free_ranges(0), vec![FreeRange { start: 0, end: 4 }]);
    }

    #[test]
    fn test_foreign_handle_is_rejected() {
        let heap = heap(4, 1);
        let slot = heap.allocate().unwrap();
        let foreign = OfflineDescriptor {
            handle: CpuDescriptorHandle(slot.handle.0 + 1),
            segment_index: 0,
        };
        assert!(heap.free(foreign).is_err());
        let missing_segment = OfflineDescriptor {
            handle: slot.handle,
            segment_index: 3,
        };
        assert!(heap.free(missing_segment).is_err());
    }

    #[test]
    fn test_grows_by_segments_up_to_cap() {
        let heap = heap(2, 2);
        let slots: Vec<_> = (0..4).map(|_| heap.allocate().unwrap()).collect();
        assert_eq!(heap.segment_count(), 2);
        assert_eq!(slots[2].segment_index, 1);

        assert!(matches!(
            heap.allocate(),
            Err(RhiError::AllocationExhausted { .. })
        ));

        // A freed slot in the first segment is found again before growing.
        heap.free(slots[1]).unwrap();
        assert_eq!(heap.allocate().unwrap(), slots[1]);

        for slot in [slots[0], slots[1], slots[2], slots[3]] {
            heap.free(slot).unwrap();
        }
        for segment in 0..2 {
            assert_eq!(heap.free_ranges(segment), vec![FreeRange { start: 0, end: 2 }]);
        }
    }

    #[test]
    fn test_segment_creation_failure_propagates() {
        let (mock, handle) = mock_handle(RhiSettings::default());
        mock.fail_heap_creation(true);
        let heap = OfflineDescriptorHeap::new(handle, DescriptorHeapKind::Sampler);
        assert!(matches!(
            heap.allocate(),
            Err(RhiError::ResourceCreationFailure { .. })
        ));
        assert_eq!(heap.segment_count(), 0);
    }

    #[test]
    fn test_drop_destroys_native_segments() {
        let (mock, handle) = mock_handle(RhiSettings::default());
        {
            let heap = OfflineDescriptorHeap::with_capacity(
                handle,
                DescriptorHeapKind::RenderTarget,
                1,
                4,
            );
            heap.allocate().unwrap();
            heap.allocate().unwrap();
            assert_eq!(mock.live_heaps(), 2);
        }
        assert_eq!(mock.live_heaps(), 0);
    }
}
