#![allow(dead_code)]
// Device queue resolution
//
// Maps a list of requested (capability, priority) pairs onto the
// physical queue families a device actually has. When a family runs
// out of distinct queues, later requests share the queue (and mutex)
// of an earlier one.

use ash::extensions::khr;
use ash::vk;

use std::sync::{Arc, Mutex};

use crate::{Result, SquallError};

/// One queue the resolver produced.
///
/// All submission and presentation for a given `vk::Queue` must be
/// serialized, so the handle travels together with its mutex. Queues
/// that were "based on" another request share the same mutex instance.
#[derive(Clone)]
pub(crate) struct ResolvedQueue {
    q_queue: vk::Queue,
    q_family_index: u32,
    q_supports_presentation: bool,
    q_family_properties: vk::QueueFamilyProperties,
    q_mutex: Arc<Mutex<()>>,
    q_based_on: usize,
}

impl ResolvedQueue {
    pub fn queue_family_index(&self) -> u32 {
        self.q_family_index
    }

    pub fn supports_presentation(&self) -> bool {
        self.q_supports_presentation
    }

    pub fn family_properties(&self) -> &vk::QueueFamilyProperties {
        &self.q_family_properties
    }

    pub fn based_on(&self) -> usize {
        self.q_based_on
    }

    /// Submit work to this queue, holding the queue mutex for the
    /// duration of the call.
    pub fn submit(
        &self,
        dev: &ash::Device,
        submits: &[vk::SubmitInfo],
        fence: vk::Fence,
    ) -> Result<()> {
        let _guard = self.q_mutex.lock().unwrap();
        unsafe {
            dev.queue_submit(self.q_queue, submits, fence)
                .map_err(SquallError::from_vk)
        }
    }

    /// Present through this queue. Returns true if the presentation
    /// engine reported the swapchain as suboptimal.
    pub fn present(
        &self,
        swapchain_loader: &khr::Swapchain,
        present_info: &vk::PresentInfoKHR,
    ) -> Result<bool> {
        let _guard = self.q_mutex.lock().unwrap();
        unsafe {
            swapchain_loader
                .queue_present(self.q_queue, present_info)
                .map_err(SquallError::from_vk)
        }
    }
}

/// Placement decision for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct QueuePlacement {
    /// Index within the family, for vkGetDeviceQueue.
    pub queue_index: u32,
    pub family_index: u32,
    /// Index of the request this one shares a queue with. Equal to the
    /// request's own index when it got a distinct queue.
    pub based_on: usize,
}

/// Choose a family for `flags`: the family with the fewest extra
/// capability bits that still covers the request. Graphics requests
/// prefer families flagged as presentation capable.
fn select_family(
    families: &[vk::QueueFamilyProperties],
    present_support: &[bool],
    flags: vk::QueueFlags,
) -> Option<usize> {
    let wants_present = flags.contains(vk::QueueFlags::GRAPHICS);
    let mut best: Option<(usize, u32, bool)> = None;

    for (i, f) in families.iter().enumerate() {
        if !f.queue_flags.contains(flags) {
            continue;
        }
        let extra_bits = (f.queue_flags.as_raw() & !flags.as_raw()).count_ones();
        let presentable = present_support[i];
        let better = match best {
            None => true,
            Some((_, best_extra, best_present)) => {
                if wants_present && presentable != best_present {
                    presentable
                } else {
                    extra_bits < best_extra
                }
            }
        };
        if better {
            best = Some((i, extra_bits, presentable));
        }
    }
    best.map(|(i, _, _)| i)
}

/// Assign every request to a family and a queue index within it.
///
/// This is the pure planning half of the resolver so it can be tested
/// against synthetic family tables.
pub(crate) fn plan_queues(
    families: &[vk::QueueFamilyProperties],
    present_support: &[bool],
    requests: &[(vk::QueueFlags, f32)],
) -> Result<Vec<QueuePlacement>> {
    let mut placements: Vec<QueuePlacement> = Vec::with_capacity(requests.len());
    // Requests already assigned to each family, in request order.
    let mut family_assignments: Vec<Vec<usize>> = vec![Vec::new(); families.len()];

    for (ri, &(flags, _priority)) in requests.iter().enumerate() {
        let family = select_family(families, present_support, flags)
            .ok_or(SquallError::NO_SUITABLE_GPU)?;

        let position = family_assignments[family].len();
        let queue_count = families[family].queue_count as usize;
        let placement = if position < queue_count {
            QueuePlacement {
                queue_index: position as u32,
                family_index: family as u32,
                based_on: ri,
            }
        } else {
            // Family is out of distinct queues, reuse an earlier
            // request's queue handle and mutex.
            let donor = family_assignments[family][position % queue_count];
            QueuePlacement {
                queue_index: placements[donor].queue_index,
                family_index: family as u32,
                based_on: donor,
            }
        };
        family_assignments[family].push(ri);
        placements.push(placement);
    }
    Ok(placements)
}

/// Resolves queue requests against a physical device and later hands
/// out the actual `ResolvedQueue` objects once the logical device
/// exists.
pub(crate) struct DeviceQueueResolver {
    qr_placements: Vec<QueuePlacement>,
    qr_priorities: Vec<(u32, Vec<f32>)>,
    qr_family_properties: Vec<vk::QueueFamilyProperties>,
    qr_present_support: Vec<bool>,
}

impl DeviceQueueResolver {
    /// Plan queue placement for `requests` on `pdev`.
    ///
    /// Presentation support is judged per family from its graphics
    /// capability here; windows verify their own surface against the
    /// chosen family again at creation time.
    pub fn new(
        inst: &ash::Instance,
        pdev: vk::PhysicalDevice,
        requests: &[(vk::QueueFlags, f32)],
    ) -> Result<Self> {
        let family_properties =
            unsafe { inst.get_physical_device_queue_family_properties(pdev) };
        let present_support: Vec<bool> = family_properties
            .iter()
            .map(|f| f.queue_flags.contains(vk::QueueFlags::GRAPHICS))
            .collect();

        let placements = plan_queues(&family_properties, &present_support, requests)?;

        // Gather per-family priority arrays for the distinct queues.
        let mut priorities: Vec<(u32, Vec<f32>)> = Vec::new();
        for (ri, p) in placements.iter().enumerate() {
            if p.based_on != ri {
                continue;
            }
            match priorities.iter_mut().find(|(fam, _)| *fam == p.family_index) {
                Some((_, list)) => list.push(requests[ri].1),
                None => priorities.push((p.family_index, vec![requests[ri].1])),
            }
        }

        Ok(Self {
            qr_placements: placements,
            qr_priorities: priorities,
            qr_family_properties: family_properties,
            qr_present_support: present_support,
        })
    }

    /// Queue create infos for vkCreateDevice. The priority slices
    /// borrow from self, so the resolver must outlive device creation.
    pub fn device_queue_create_infos(&self) -> Vec<vk::DeviceQueueCreateInfo> {
        self.qr_priorities
            .iter()
            .map(|(family, priorities)| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(*family)
                    .queue_priorities(priorities.as_slice())
                    .build()
            })
            .collect()
    }

    /// Fetch the resolved queues from a freshly created device, in
    /// request order.
    pub fn get_queues(&self, dev: &ash::Device) -> Vec<ResolvedQueue> {
        let mut queues: Vec<ResolvedQueue> = Vec::with_capacity(self.qr_placements.len());
        for (ri, p) in self.qr_placements.iter().enumerate() {
            if p.based_on == ri {
                let queue =
                    unsafe { dev.get_device_queue(p.family_index, p.queue_index) };
                queues.push(ResolvedQueue {
                    q_queue: queue,
                    q_family_index: p.family_index,
                    q_supports_presentation: self.qr_present_support
                        [p.family_index as usize],
                    q_family_properties: self.qr_family_properties
                        [p.family_index as usize],
                    q_mutex: Arc::new(Mutex::new(())),
                    q_based_on: ri,
                });
            } else {
                let donor = queues[p.based_on].clone();
                queues.push(ResolvedQueue {
                    q_based_on: p.based_on,
                    ..donor
                });
            }
        }
        queues
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags, count: u32) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: count,
            timestamp_valid_bits: 0,
            min_image_transfer_granularity: vk::Extent3D::default(),
        }
    }

    #[test]
    fn prefers_fewest_extra_capabilities() {
        // A dedicated transfer family must win over the do-everything
        // family for a transfer request.
        let families = [
            family(
                vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
                4,
            ),
            family(vk::QueueFlags::TRANSFER, 2),
        ];
        let present = [true, false];
        let plan = plan_queues(&families, &present, &[(vk::QueueFlags::TRANSFER, 1.0)]).unwrap();
        assert_eq!(plan[0].family_index, 1);
        assert_eq!(plan[0].queue_index, 0);
        assert_eq!(plan[0].based_on, 0);
    }

    #[test]
    fn overflow_requests_are_based_on_earlier_ones() {
        let families = [family(vk::QueueFlags::GRAPHICS, 1)];
        let present = [true];
        let requests = [
            (vk::QueueFlags::GRAPHICS, 1.0),
            (vk::QueueFlags::GRAPHICS, 0.2),
        ];
        let plan = plan_queues(&families, &present, &requests).unwrap();
        assert_eq!(plan[0].based_on, 0);
        assert_eq!(plan[1].based_on, 0);
        assert_eq!(plan[1].queue_index, plan[0].queue_index);
    }

    #[test]
    fn graphics_prefers_presentation_capable_family() {
        let families = [
            family(vk::QueueFlags::GRAPHICS, 1),
            family(vk::QueueFlags::GRAPHICS, 1),
        ];
        // Only the second family can present.
        let present = [false, true];
        let plan = plan_queues(&families, &present, &[(vk::QueueFlags::GRAPHICS, 1.0)]).unwrap();
        assert_eq!(plan[0].family_index, 1);
    }

    #[test]
    fn unsatisfiable_request_errors() {
        let families = [family(vk::QueueFlags::TRANSFER, 1)];
        let present = [false];
        assert!(plan_queues(&families, &present, &[(vk::QueueFlags::COMPUTE, 1.0)]).is_err());
    }
}
