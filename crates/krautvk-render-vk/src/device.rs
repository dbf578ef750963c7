// SPDX-License-Identifier: CEPL-1.0
use crate::error::RenderError;
use ash::khr::{surface, swapchain};
use ash::prelude::VkResult;
use ash::vk;
use tracing::{debug, info};

pub const MIN_IMAGE_DIMENSION_2D: u32 = 4096;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueFamilyInfo {
    pub flags: vk::QueueFlags,
    pub queue_count: u32,
    pub supports_present: bool,
}

/// What selection needs to know about one physical device.
#[derive(Clone, Debug)]
pub struct AdapterCandidate<H> {
    pub handle: H,
    pub name: String,
    pub api_version: u32,
    pub max_image_dimension_2d: u32,
    pub has_required_extensions: bool,
    pub queue_families: Vec<QueueFamilyInfo>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SelectedAdapter<H> {
    pub handle: H,
    pub name: String,
    pub graphics_family: u32,
    pub present_family: u32,
}

impl<H> SelectedAdapter<H> {
    pub fn shares_queue_family(&self) -> bool {
        self.graphics_family == self.present_family
    }
}

/// First-fit: the first candidate meeting every requirement wins, no scoring.
pub fn select_adapter<H: Copy>(
    candidates: &[AdapterCandidate<H>],
) -> Result<SelectedAdapter<H>, RenderError> {
    for c in candidates {
        if !c.has_required_extensions {
            debug!(device = %c.name, "rejected: missing swapchain extension");
            continue;
        }
        if vk::api_version_major(c.api_version) < 1 {
            debug!(device = %c.name, "rejected: api version");
            continue;
        }
        if c.max_image_dimension_2d < MIN_IMAGE_DIMENSION_2D {
            debug!(
                device = %c.name,
                max = c.max_image_dimension_2d,
                "rejected: maxImageDimension2D"
            );
            continue;
        }

        let graphics = c
            .queue_families
            .iter()
            .position(|q| q.queue_count > 0 && q.flags.contains(vk::QueueFlags::GRAPHICS));
        let present = c.queue_families.iter().position(|q| q.supports_present);

        match (graphics, present) {
            (Some(g), Some(p)) => {
                info!(
                    "Selected device: {} (graphics family {}, present family {})",
                    c.name, g, p
                );
                return Ok(SelectedAdapter {
                    handle: c.handle,
                    name: c.name.clone(),
                    graphics_family: g as u32,
                    present_family: p as u32,
                });
            }
            _ => debug!(device = %c.name, "rejected: no graphics or present family"),
        }
    }
    Err(RenderError::NoSuitableDevice)
}

/// Gathers selection input for every physical device against `surface_handle`.
///
/// # Safety
/// `instance` and `surface_handle` must be live and belong together.
pub(crate) unsafe fn enumerate_candidates(
    instance: &ash::Instance,
    surface_loader: &surface::Instance,
    surface_handle: vk::SurfaceKHR,
) -> VkResult<Vec<AdapterCandidate<vk::PhysicalDevice>>> {
    let devices = unsafe { instance.enumerate_physical_devices()? };
    let mut out = Vec::with_capacity(devices.len());

    for phys in devices {
        let props = unsafe { instance.get_physical_device_properties(phys) };
        let name = props
            .device_name_as_c_str()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "<unnamed>".to_owned());

        // A failed extension query just disqualifies this device.
        let has_required_extensions = unsafe { instance.enumerate_device_extension_properties(phys) }
            .map(|exts| {
                exts.iter()
                    .any(|e| e.extension_name_as_c_str() == Ok(swapchain::NAME))
            })
            .unwrap_or(false);

        let queue_families =
            unsafe { instance.get_physical_device_queue_family_properties(phys) }
                .iter()
                .enumerate()
                .map(|(i, q)| QueueFamilyInfo {
                    flags: q.queue_flags,
                    queue_count: q.queue_count,
                    supports_present: unsafe {
                        surface_loader.get_physical_device_surface_support(
                            phys,
                            i as u32,
                            surface_handle,
                        )
                    }
                    .unwrap_or(false),
                })
                .collect();

        out.push(AdapterCandidate {
            handle: phys,
            name,
            api_version: props.api_version,
            max_image_dimension_2d: props.limits.max_image_dimension2_d,
            has_required_extensions,
            queue_families,
        });
    }
    Ok(out)
}
