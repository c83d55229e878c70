//! Deferred destruction of GPU objects.
//!
//! With several frames in flight a resource released by the CPU may still be
//! read by a command buffer the GPU has not finished. Destructors are queued
//! here and only run after enough frame generations have passed, or
//! immediately at teardown once the device is idle.

use crate::buffer::GpuBuffer;
use crate::image::GpuImage;
use crate::memory::SharedAllocator;
use ash::vk;
use std::collections::VecDeque;
use std::sync::Arc;

struct DeletionEntry {
    destroy: Box<dyn FnOnce()>,
    age: u32,
}

/// FIFO queue of deferred destructors.
pub struct DeletionQueue {
    entries: VecDeque<DeletionEntry>,
    retire_after: u32,
}

impl DeletionQueue {
    /// Create a queue whose entries run once they have survived
    /// `retire_after` ticks.
    pub fn new(retire_after: u32) -> Self {
        Self {
            entries: VecDeque::new(),
            retire_after,
        }
    }

    /// Queue sized for `frames_in_flight` concurrent frames.
    pub fn for_frames_in_flight(frames_in_flight: usize) -> Self {
        Self::new(frames_in_flight as u32 + 1)
    }

    /// Number of ticks an entry must survive before it runs.
    pub fn retire_after(&self) -> u32 {
        self.retire_after
    }

    /// Number of pending destructors.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Enqueue a destructor. Nothing runs until [`Self::execute`].
    pub fn submit<F>(&mut self, destroy: F)
    where
        F: FnOnce() + 'static,
    {
        self.entries.push_back(DeletionEntry {
            destroy: Box::new(destroy),
            age: 0,
        });
    }

    /// Run every destructor that is old enough, or all of them when
    /// `force_immediate` is set, and age the rest by one tick.
    ///
    /// Returns the number of destructors run. Call once per frame, and once
    /// with `force_immediate` after the device is idle at shutdown.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn execute(&mut self, force_immediate: bool) -> usize {
        let mut executed = 0;
        let mut survivors = VecDeque::with_capacity(self.entries.len());

        while let Some(mut entry) = self.entries.pop_front() {
            if force_immediate || entry.age >= self.retire_after {
                (entry.destroy)();
                executed += 1;
            } else {
                entry.age += 1;
                survivors.push_back(entry);
            }
        }

        self.entries = survivors;
        if executed > 0 {
            tracing::trace!(executed, pending = self.entries.len(), "deletion queue tick");
        }
        executed
    }

    /// Defer destruction of a buffer and its memory.
    pub fn retire_buffer(&mut self, allocator: &SharedAllocator, buffer: GpuBuffer) {
        let allocator = Arc::clone(allocator);
        self.submit(move || {
            if let Err(e) = allocator.lock().destroy_buffer(buffer) {
                tracing::error!("Failed to destroy retired buffer: {e}");
            }
        });
    }

    /// Defer destruction of an image and its memory.
    pub fn retire_image(&mut self, allocator: &SharedAllocator, image: GpuImage) {
        let allocator = Arc::clone(allocator);
        self.submit(move || {
            if let Err(e) = allocator.lock().destroy_image(image) {
                tracing::error!("Failed to destroy retired image: {e}");
            }
        });
    }

    /// Defer destruction of an image view.
    pub fn retire_image_view(&mut self, device: &Arc<ash::Device>, view: vk::ImageView) {
        let device = Arc::clone(device);
        self.submit(move || unsafe { device.destroy_image_view(view, None) });
    }

    /// Defer destruction of a sampler.
    pub fn retire_sampler(&mut self, device: &Arc<ash::Device>, sampler: vk::Sampler) {
        let device = Arc::clone(device);
        self.submit(move || unsafe { device.destroy_sampler(sampler, None) });
    }
}

impl Drop for DeletionQueue {
    fn drop(&mut self) {
        if !self.entries.is_empty() {
            tracing::warn!(
                pending = self.entries.len(),
                "Deletion queue dropped with pending entries; GPU objects leaked"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    fn counting_queue(n: usize, retire_after: u32) -> (DeletionQueue, Rc<Cell<usize>>) {
        let counter = Rc::new(Cell::new(0));
        let mut queue = DeletionQueue::new(retire_after);
        for _ in 0..n {
            let counter = Rc::clone(&counter);
            queue.submit(move || counter.set(counter.get() + 1));
        }
        (queue, counter)
    }

    #[test]
    fn submit_has_no_side_effects() {
        let (mut queue, counter) = counting_queue(4, 3);
        assert_eq!(counter.get(), 0);
        assert_eq!(queue.len(), 4);
        queue.execute(true);
    }

    #[test]
    fn nothing_runs_before_three_ticks() {
        let (mut queue, counter) = counting_queue(5, 3);
        for _ in 0..3 {
            assert_eq!(queue.execute(false), 0);
        }
        assert_eq!(counter.get(), 0);

        assert_eq!(queue.execute(false), 5);
        assert_eq!(counter.get(), 5);
        assert!(queue.is_empty());
    }

    #[test]
    fn forced_tick_empties_queue() {
        let (mut queue, counter) = counting_queue(7, 3);
        queue.execute(false);
        assert_eq!(queue.execute(true), 7);
        assert_eq!(counter.get(), 7);
        assert!(queue.is_empty());
    }

    #[test]
    fn entries_age_independently() {
        let (mut queue, counter) = counting_queue(1, 3);
        queue.execute(false);
        queue.execute(false);

        let late = Rc::clone(&counter);
        queue.submit(move || late.set(late.get() + 10));

        queue.execute(false);
        assert_eq!(queue.execute(false), 1);
        assert_eq!(counter.get(), 1);
        assert_eq!(queue.len(), 1);

        queue.execute(false);
        assert_eq!(queue.execute(false), 1);
        assert_eq!(counter.get(), 11);
    }

    #[test]
    fn runs_in_submission_order() {
        let order = Rc::new(std::cell::RefCell::new(Vec::new()));
        let mut queue = DeletionQueue::new(0);
        for i in 0..3 {
            let order = Rc::clone(&order);
            queue.submit(move || order.borrow_mut().push(i));
        }
        queue.execute(false);
        assert_eq!(*order.borrow(), vec![0, 1, 2]);
    }

    #[test]
    fn sized_from_frames_in_flight() {
        assert_eq!(DeletionQueue::for_frames_in_flight(2).retire_after(), 3);
    }
}
