// SPDX-License-Identifier: CEPL-1.0
//! Swapchain parameter selection. Pure functions over queried surface data;
//! every tie-break here is deliberate and covered by the tests below.

use crate::error::RenderError;
use ash::vk;

/// Extent used when the surface leaves the size up to the swapchain.
pub const DEFAULT_EXTENT: vk::Extent2D = vk::Extent2D {
    width: 640,
    height: 480,
};

/// Used verbatim when the surface has no format preference, and preferred
/// (by format) when it lists one.
pub const PREFERRED_FORMAT: vk::SurfaceFormatKHR = vk::SurfaceFormatKHR {
    format: vk::Format::R8G8B8A8_UNORM,
    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SwapchainConfig {
    pub image_count: u32,
    pub surface_format: vk::SurfaceFormatKHR,
    pub extent: vk::Extent2D,
    pub usage: vk::ImageUsageFlags,
    pub transform: vk::SurfaceTransformFlagsKHR,
    pub present_mode: vk::PresentModeKHR,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Negotiated {
    Ready(SwapchainConfig),
    /// Minimized window; nothing to build.
    ZeroExtent,
}

pub fn image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let wanted = caps.min_image_count + 1;
    if caps.max_image_count > 0 {
        wanted.min(caps.max_image_count)
    } else {
        wanted
    }
}

pub fn surface_format(
    formats: &[vk::SurfaceFormatKHR],
) -> Result<vk::SurfaceFormatKHR, RenderError> {
    match formats {
        [] => Err(RenderError::NoSurfaceFormats),
        [only] if only.format == vk::Format::UNDEFINED => Ok(PREFERRED_FORMAT),
        _ => Ok(formats
            .iter()
            .copied()
            .find(|f| f.format == PREFERRED_FORMAT.format)
            .unwrap_or(formats[0])),
    }
}

/// `candidate` only matters when the surface reports the `u32::MAX` sentinel.
pub fn extent(caps: &vk::SurfaceCapabilitiesKHR, candidate: vk::Extent2D) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        return caps.current_extent;
    }
    vk::Extent2D {
        width: candidate
            .width
            .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
        height: candidate
            .height
            .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
    }
}

pub fn usage(caps: &vk::SurfaceCapabilitiesKHR) -> Result<vk::ImageUsageFlags, RenderError> {
    if caps
        .supported_usage_flags
        .contains(vk::ImageUsageFlags::TRANSFER_DST)
    {
        Ok(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
    } else {
        Err(RenderError::UnsupportedSwapchainUsage(
            caps.supported_usage_flags,
        ))
    }
}

pub fn transform(caps: &vk::SurfaceCapabilitiesKHR) -> vk::SurfaceTransformFlagsKHR {
    if caps
        .supported_transforms
        .contains(vk::SurfaceTransformFlagsKHR::IDENTITY)
    {
        vk::SurfaceTransformFlagsKHR::IDENTITY
    } else {
        caps.current_transform
    }
}

pub fn present_mode(modes: &[vk::PresentModeKHR]) -> Result<vk::PresentModeKHR, RenderError> {
    [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::FIFO]
        .into_iter()
        .find(|m| modes.contains(m))
        .ok_or(RenderError::UnsupportedPresentMode)
}

pub fn negotiate(
    caps: &vk::SurfaceCapabilitiesKHR,
    formats: &[vk::SurfaceFormatKHR],
    modes: &[vk::PresentModeKHR],
    candidate: vk::Extent2D,
) -> Result<Negotiated, RenderError> {
    // Hard requirements first: a minimized window must not mask an unusable surface.
    let surface_format = surface_format(formats)?;
    let usage = usage(caps)?;
    let present_mode = present_mode(modes)?;

    let extent = extent(caps, candidate);
    if extent.width == 0 || extent.height == 0 {
        return Ok(Negotiated::ZeroExtent);
    }
    Ok(Negotiated::Ready(SwapchainConfig {
        image_count: image_count(caps),
        surface_format,
        extent,
        usage,
        transform: transform(caps),
        present_mode,
    }))
}
