//! Display loop.
//!
//! One dedicated thread owns composition: each cycle it waits for its frame
//! slot to retire, acquires a platform image, sweeps every virtual
//! swapchain's queued ring under the engine lock, blits the most recent
//! buffer of each into the platform image (painter's order, sequential),
//! submits, presents, and ferries the exported present fence back into the
//! buffers it read.
//!
//! Lock order within a cycle is surface -> engine -> queue (the queue mutex
//! lives inside the driver) and is never reversed.

use std::sync::atomic::Ordering;
use std::time::Instant;

use crate::core::compositor::Shared;
use crate::core::engine::BufferState;
use crate::gpu::{GpuError, SemaphoreId, FRAMES_IN_FLIGHT};
use crate::util::fd::{close_raw, SyncFd};

pub(crate) fn run_display_loop(shared: &Shared) {
    let mut frame_slot = 0usize;

    loop {
        // Coarse wakeup for dequeue waiters: one per composition cycle.
        shared.engine.notify_waiters();
        if shared.stop.load(Ordering::SeqCst) {
            break;
        }

        // Frame pacing: this slot's previous composition must have retired.
        if let Err(e) = shared.driver.begin_frame(frame_slot) {
            tracing::error!("display: begin_frame failed: {e}");
            break;
        }

        let mut surface = shared.surface.lock().unwrap();
        while !surface.alive {
            if shared.stop.load(Ordering::SeqCst) {
                return;
            }
            surface = shared.surface_cv.wait(surface).unwrap();
        }

        let display_image = match shared.driver.acquire_display_image(frame_slot) {
            Ok(index) => index,
            Err(e) => {
                // Out-of-date or lost platform swapchain: tear it down and
                // pause until the surface provider hands us a new one.
                // Clients are not notified; their frames are dropped.
                handle_fatal_surface_error(shared, &mut surface, &e);
                continue;
            }
        };

        if surface.needs_layout_transition {
            shared.driver.record_display_layout_transition(frame_slot);
            surface.needs_layout_transition = false;
        }
        let surface_extent = surface.extent;

        // Per-frame critical section: drain queued rings, record blits,
        // submit, and ferry acquire fences, all under the engine lock so a
        // concurrent teardown cannot destroy a semaphore the submission is
        // about to wait on.
        {
            let now = Instant::now();
            let mut engine = shared.engine.lock_state();
            let mut waits: Vec<SemaphoreId> = Vec::new();
            let mut composited: Vec<(u32, u32)> = Vec::new();

            for (&handle, swapchain) in engine.swapchains.iter_mut() {
                if let Some(index) = swapchain.pending.pop_front() {
                    swapchain.note_composited_frame(handle, now);
                    swapchain.last_presented = index;
                    let slot = &mut swapchain.buffers[index as usize];
                    // Capturing the semaphore into the wait set moves the
                    // buffer back to Free (ownership of the wait is now the
                    // GPU queue's).
                    waits.push(slot.queue_semaphore);
                    slot.state = BufferState::Free;
                }

                let index = swapchain.last_presented;
                let slot = &swapchain.buffers[index as usize];
                if slot.state != BufferState::Free {
                    // Never composited and currently written by the client;
                    // nothing stable to show yet.
                    continue;
                }
                composited.push((handle, index));
                shared.driver.record_blit(
                    frame_slot,
                    slot.image,
                    swapchain.extent,
                    display_image,
                    surface_extent,
                );
            }

            if let Err(e) = shared
                .driver
                .submit_and_present(frame_slot, display_image, &waits)
            {
                drop(engine);
                handle_fatal_surface_error(shared, &mut surface, &e);
                continue;
            }

            match shared.driver.export_present_fence(frame_slot) {
                Ok(raw) => {
                    // Some drivers hand back descriptor 0 here; normalize
                    // to the "already signaled" sentinel.
                    let raw = if raw == 0 { -1 } else { raw };
                    for (handle, index) in composited {
                        if let Some(swapchain) = engine.swapchains.get_mut(&handle) {
                            swapchain.buffers[index as usize]
                                .acquire_fence
                                .replace(SyncFd::dup_raw(raw));
                        }
                    }
                    close_raw(raw);
                }
                Err(e) => {
                    tracing::warn!("display: present fence export failed: {e}");
                }
            }
        }

        drop(surface);
        frame_slot = (frame_slot + 1) % FRAMES_IN_FLIGHT;
    }
}

fn handle_fatal_surface_error(
    shared: &Shared,
    surface: &mut std::sync::MutexGuard<'_, crate::core::compositor::SurfaceState>,
    error: &GpuError,
) {
    tracing::warn!("display: platform swapchain lost ({error}); waiting for a new surface");
    shared.driver.wait_idle();
    shared.driver.destroy_display_swapchain();
    surface.alive = false;
}
