// SPDX-License-Identifier: CEPL-1.0
//! One-shot construction of the instance, surface, device and static buffers.
//! Each step fails with the `InitStage` whose status code the C ABI reports.

use crate::device::{enumerate_candidates, select_adapter, SelectedAdapter};
use crate::driver::{AshGpu, DebugMessenger, PresentSurface, ShaderSet, VulkanInstance};
use crate::error::{InitError, InitStage, StageExt};
use crate::gpu::{Gpu, QueueRef, Scoped};
use crate::record::{Vertex, VertexBuffer};
use anyhow::{anyhow, Context};
use ash::ext::debug_utils;
use ash::khr::{surface, swapchain};
use ash::vk;
use ash::Entry;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle};
use std::borrow::Cow;
use std::ffi::{c_void, CStr};
use std::io::Cursor;
use std::path::Path;
use std::rc::Rc;
use tracing::{debug, error, info, warn};

const APP_NAME: &CStr = c"KrautVK";
const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

const EMBEDDED_VERT: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/shadervert.spv"));
const EMBEDDED_FRAG: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/shaderfrag.spv"));

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _types: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user: *mut c_void,
) -> vk::Bool32 {
    let message = if data.is_null() || unsafe { (*data).p_message.is_null() } {
        Cow::Borrowed("<no message>")
    } else {
        unsafe { CStr::from_ptr((*data).p_message) }.to_string_lossy()
    };
    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        error!(target: "vulkan", "{message}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        warn!(target: "vulkan", "{message}");
    } else {
        debug!(target: "vulkan", "{message}");
    }
    vk::FALSE
}

fn validation_available(entry: &Entry) -> bool {
    cfg!(debug_assertions)
        && unsafe { entry.enumerate_instance_layer_properties() }
            .map(|layers| {
                layers
                    .iter()
                    .any(|l| l.layer_name_as_c_str() == Ok(VALIDATION_LAYER))
            })
            .unwrap_or(false)
}

pub(crate) fn create_instance(display: RawDisplayHandle) -> Result<VulkanInstance, InitError> {
    let entry = Entry::linked();

    // A loader that cannot even list extensions means no usable Vulkan.
    unsafe { entry.enumerate_instance_extension_properties(None) }
        .context("enumerate_instance_extension_properties")
        .stage(InitStage::VulkanUnsupported)?;

    let mut extensions = ash_window::enumerate_required_extensions(display)
        .context("enumerate_required_extensions")
        .stage(InitStage::VulkanUnsupported)?
        .to_vec();

    let validation = validation_available(&entry);
    let layers = [VALIDATION_LAYER.as_ptr()];
    if validation {
        extensions.push(debug_utils::NAME.as_ptr());
    }

    let app_info = vk::ApplicationInfo {
        s_type: vk::StructureType::APPLICATION_INFO,
        p_application_name: APP_NAME.as_ptr(),
        application_version: 0,
        p_engine_name: APP_NAME.as_ptr(),
        engine_version: 0,
        api_version: vk::API_VERSION_1_0,
        ..Default::default()
    };
    let create_info = vk::InstanceCreateInfo {
        s_type: vk::StructureType::INSTANCE_CREATE_INFO,
        p_application_info: &app_info,
        enabled_extension_count: extensions.len() as u32,
        pp_enabled_extension_names: extensions.as_ptr(),
        enabled_layer_count: if validation { layers.len() as u32 } else { 0 },
        pp_enabled_layer_names: layers.as_ptr(),
        ..Default::default()
    };

    let instance = unsafe { entry.create_instance(&create_info, None) }
        .context("create_instance")
        .stage(InitStage::Instance)?;

    let mut vulkan = VulkanInstance {
        entry,
        instance,
        debug: None,
    };
    if validation {
        vulkan.debug = create_messenger(&vulkan);
    }
    Ok(vulkan)
}

// Best effort: a missing messenger only costs diagnostics.
fn create_messenger(vulkan: &VulkanInstance) -> Option<DebugMessenger> {
    let loader = debug_utils::Instance::new(&vulkan.entry, &vulkan.instance);
    let info = vk::DebugUtilsMessengerCreateInfoEXT {
        s_type: vk::StructureType::DEBUG_UTILS_MESSENGER_CREATE_INFO_EXT,
        message_severity: vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
            | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        message_type: vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
            | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
            | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        pfn_user_callback: Some(debug_callback),
        ..Default::default()
    };
    match unsafe { loader.create_debug_utils_messenger(&info, None) } {
        Ok(messenger) => {
            info!("Vulkan validation enabled");
            Some(DebugMessenger { loader, messenger })
        }
        Err(e) => {
            warn!("debug messenger unavailable: {e}");
            None
        }
    }
}

pub(crate) fn create_surface(
    vulkan: &VulkanInstance,
    window: &dyn HasWindowHandle,
    display: &dyn HasDisplayHandle,
) -> Result<PresentSurface, InitError> {
    let dh = display
        .display_handle()
        .context("display_handle")
        .stage(InitStage::Surface)?
        .as_raw();
    let wh = window
        .window_handle()
        .context("window_handle")
        .stage(InitStage::Surface)?
        .as_raw();

    let handle =
        unsafe { ash_window::create_surface(&vulkan.entry, &vulkan.instance, dh, wh, None) }
            .context("create_surface")
            .stage(InitStage::Surface)?;
    Ok(PresentSurface {
        loader: surface::Instance::new(&vulkan.entry, &vulkan.instance),
        handle,
    })
}

pub(crate) fn select_device(
    vulkan: &VulkanInstance,
    surface: &PresentSurface,
) -> Result<SelectedAdapter<vk::PhysicalDevice>, InitError> {
    let candidates =
        unsafe { enumerate_candidates(&vulkan.instance, &surface.loader, surface.handle) }
            .context("enumerate_physical_devices")
            .stage(InitStage::VulkanUnsupported)?;
    Ok(select_adapter(&candidates)?)
}

/// SPIR-V from `<dir>/shadervert.spv` and `<dir>/shaderfrag.spv`, or the
/// shaders compiled into the crate when no directory is given.
pub(crate) fn load_shaders(dir: Option<&Path>) -> Result<ShaderSet, InitError> {
    let (vertex, fragment) = match dir {
        Some(dir) => (
            read_spv_file(&dir.join("shadervert.spv")).stage(InitStage::Pipelines)?,
            read_spv_file(&dir.join("shaderfrag.spv")).stage(InitStage::Pipelines)?,
        ),
        None => (
            ash::util::read_spv(&mut Cursor::new(EMBEDDED_VERT))
                .context("embedded vertex shader")
                .stage(InitStage::Pipelines)?,
            ash::util::read_spv(&mut Cursor::new(EMBEDDED_FRAG))
                .context("embedded fragment shader")
                .stage(InitStage::Pipelines)?,
        ),
    };
    Ok(ShaderSet { vertex, fragment })
}

fn read_spv_file(path: &Path) -> anyhow::Result<Vec<u32>> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let words = ash::util::read_spv(&mut Cursor::new(&bytes[..]))
        .with_context(|| format!("parsing {}", path.display()))?;
    debug!(path = %path.display(), words = words.len(), "shader loaded");
    Ok(words)
}

/// Takes ownership of instance and surface; on failure they are released here,
/// surface first.
pub(crate) fn create_device(
    instance: VulkanInstance,
    surface: PresentSurface,
    adapter: &SelectedAdapter<vk::PhysicalDevice>,
    shaders: ShaderSet,
) -> Result<(Rc<AshGpu>, QueueRef, QueueRef), InitError> {
    let priorities = [1.0_f32];
    let queue_info = |family: u32| vk::DeviceQueueCreateInfo {
        s_type: vk::StructureType::DEVICE_QUEUE_CREATE_INFO,
        queue_family_index: family,
        queue_count: 1,
        p_queue_priorities: priorities.as_ptr(),
        ..Default::default()
    };
    let mut queue_infos = vec![queue_info(adapter.graphics_family)];
    if !adapter.shares_queue_family() {
        queue_infos.push(queue_info(adapter.present_family));
    }

    let device_exts = [swapchain::NAME.as_ptr()];
    let dinfo = vk::DeviceCreateInfo {
        s_type: vk::StructureType::DEVICE_CREATE_INFO,
        queue_create_info_count: queue_infos.len() as u32,
        p_queue_create_infos: queue_infos.as_ptr(),
        enabled_extension_count: device_exts.len() as u32,
        pp_enabled_extension_names: device_exts.as_ptr(),
        ..Default::default()
    };

    let device = unsafe {
        instance
            .instance
            .create_device(adapter.handle, &dinfo, None)
    }
    .context("create_device")
    .stage(InitStage::Device)?;

    let graphics = QueueRef {
        handle: unsafe { device.get_device_queue(adapter.graphics_family, 0) },
        family: adapter.graphics_family,
    };
    let present = QueueRef {
        handle: unsafe { device.get_device_queue(adapter.present_family, 0) },
        family: adapter.present_family,
    };

    let memory_properties = unsafe {
        instance
            .instance
            .get_physical_device_memory_properties(adapter.handle)
    };
    let swapchain_loader = swapchain::Device::new(&instance.instance, &device);

    let gpu = Rc::new(AshGpu {
        device,
        swapchain_loader,
        physical: adapter.handle,
        memory_properties,
        shaders,
        surface,
        instance,
    });
    Ok((gpu, graphics, present))
}

fn create_buffer(
    gpu: &Rc<AshGpu>,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    props: vk::MemoryPropertyFlags,
) -> anyhow::Result<VertexBuffer<AshGpu>> {
    let info = vk::BufferCreateInfo {
        s_type: vk::StructureType::BUFFER_CREATE_INFO,
        size,
        usage,
        sharing_mode: vk::SharingMode::EXCLUSIVE,
        ..Default::default()
    };
    let buffer = Scoped::new(
        gpu,
        unsafe { gpu.device.create_buffer(&info, None) }.context("create_buffer")?,
    );

    let req = unsafe { gpu.device.get_buffer_memory_requirements(buffer.handle()) };
    let memory_type_index = gpu
        .find_memory_type(req.memory_type_bits, props)
        .ok_or_else(|| anyhow!("no memory type with {props:?}"))?;
    let alloc = vk::MemoryAllocateInfo {
        s_type: vk::StructureType::MEMORY_ALLOCATE_INFO,
        allocation_size: req.size,
        memory_type_index,
        ..Default::default()
    };
    let memory = Scoped::new(
        gpu,
        unsafe { gpu.device.allocate_memory(&alloc, None) }.context("allocate_memory")?,
    );
    unsafe {
        gpu.device
            .bind_buffer_memory(buffer.handle(), memory.handle(), 0)
    }
    .context("bind_buffer_memory")?;

    Ok(VertexBuffer { buffer, memory })
}

/// Copies `vertices` into a device-local buffer through a host-visible staging
/// buffer, blocking on the graphics queue until the copy is done.
pub(crate) fn upload_vertices(
    gpu: &Rc<AshGpu>,
    queue: QueueRef,
    vertices: &[Vertex],
) -> Result<VertexBuffer<AshGpu>, InitError> {
    upload(gpu, queue, bytemuck::cast_slice(vertices)).stage(InitStage::VertexBuffer)
}

fn upload(gpu: &Rc<AshGpu>, queue: QueueRef, bytes: &[u8]) -> anyhow::Result<VertexBuffer<AshGpu>> {
    let size = bytes.len() as vk::DeviceSize;

    let staging = create_buffer(
        gpu,
        size,
        vk::BufferUsageFlags::TRANSFER_SRC,
        vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
    )?;
    unsafe {
        let ptr = gpu
            .device
            .map_memory(staging.memory.handle(), 0, size, vk::MemoryMapFlags::empty())
            .context("map_memory")?;
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.cast::<u8>(), bytes.len());
        gpu.device.unmap_memory(staging.memory.handle());
    }

    let local = create_buffer(
        gpu,
        size,
        vk::BufferUsageFlags::TRANSFER_DST | vk::BufferUsageFlags::VERTEX_BUFFER,
        vk::MemoryPropertyFlags::DEVICE_LOCAL,
    )?;

    let pool = Scoped::new(
        gpu,
        gpu.create_command_pool(queue.family)
            .context("create_command_pool")?,
    );
    let cmd = gpu
        .allocate_command_buffers(pool.handle(), 1)
        .context("allocate_command_buffers")?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("no command buffer allocated"))?;

    gpu.begin_commands(cmd).context("begin_command_buffer")?;
    let region = vk::BufferCopy {
        src_offset: 0,
        dst_offset: 0,
        size,
    };
    unsafe {
        gpu.device.cmd_copy_buffer(
            cmd,
            staging.buffer.handle(),
            local.buffer.handle(),
            std::slice::from_ref(&region),
        )
    };
    gpu.end_commands(cmd).context("end_command_buffer")?;

    let submit = vk::SubmitInfo {
        s_type: vk::StructureType::SUBMIT_INFO,
        command_buffer_count: 1,
        p_command_buffers: &cmd,
        ..Default::default()
    };
    unsafe {
        gpu.device
            .queue_submit(queue.handle, std::slice::from_ref(&submit), vk::Fence::null())
            .context("queue_submit")?;
        gpu.device
            .queue_wait_idle(queue.handle)
            .context("queue_wait_idle")?;
    }

    debug!(bytes = bytes.len(), "vertex buffer uploaded");
    Ok(local)
}
