//! Vulkan GPU context.
//!
//! One process-wide context: loader, instance (debug-report + surface +
//! android-surface extensions), first physical device, a device exposing
//! swapchain / external-memory / external-semaphore-fd, and the first queue
//! family that offers both graphics and compute. A single mutex serializes
//! every submit and present; the queue is not thread-safe.
//!
//! Client images are backed by imported hardware buffers so the same memory
//! is visible to the client's own device. On non-Android targets the
//! platform-buffer entry points report `PlatformBufferUnsupported`; the rest
//! of the context still builds so the server links everywhere.

use std::ffi::{c_char, c_void, CStr};
use std::os::unix::io::RawFd;
use std::sync::Mutex;

use ash::vk::{self, Handle};

use crate::core::protocol::Extent2d;
use crate::gpu::{
    platform_buffer_format, GpuDriver, GpuError, GpuResult, ImageId, MemoryId, PlatformBufferId,
    SemaphoreId, WindowHandle, FRAMES_IN_FLIGHT, MAX_SWAPCHAIN_IMAGES,
};
use crate::util::fd::close_raw;

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

const INSTANCE_EXTENSIONS: [&CStr; 3] = [
    ash::ext::debug_report::NAME,
    ash::khr::surface::NAME,
    ash::khr::android_surface::NAME,
];

const DEVICE_EXTENSIONS: [&CStr; 5] = [
    ash::khr::swapchain::NAME,
    ash::khr::external_memory::NAME,
    ash::android::external_memory_android_hardware_buffer::NAME,
    ash::khr::external_semaphore::NAME,
    ash::khr::external_semaphore_fd::NAME,
];

struct FrameSlot {
    command_buffer: vk::CommandBuffer,
    image_acquired: vk::Semaphore,
    client_present_done: vk::Semaphore,
    composite_done: vk::Fence,
}

struct VkDisplay {
    surface: vk::SurfaceKHR,
    swapchain: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    present_ready: Vec<vk::Semaphore>,
}

pub struct VulkanDriver {
    _entry: ash::Entry,
    instance: ash::Instance,
    debug: (ash::ext::debug_report::Instance, vk::DebugReportCallbackEXT),
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    queue: vk::Queue,
    queue_lock: Mutex<()>,
    khr_surface: ash::khr::surface::Instance,
    khr_android_surface: ash::khr::android_surface::Instance,
    khr_swapchain: ash::khr::swapchain::Device,
    khr_semaphore_fd: ash::khr::external_semaphore_fd::Device,
    command_pool: vk::CommandPool,
    frames: Vec<FrameSlot>,
    display: Mutex<Option<VkDisplay>>,
}

fn has_extension(props: &[vk::ExtensionProperties], name: &CStr) -> bool {
    props
        .iter()
        .any(|p| unsafe { CStr::from_ptr(p.extension_name.as_ptr()) } == name)
}

fn has_layer(props: &[vk::LayerProperties], name: &CStr) -> bool {
    props
        .iter()
        .any(|p| unsafe { CStr::from_ptr(p.layer_name.as_ptr()) } == name)
}

unsafe extern "system" fn debug_report_callback(
    flags: vk::DebugReportFlagsEXT,
    _object_type: vk::DebugReportObjectTypeEXT,
    _object: u64,
    _location: usize,
    _message_code: i32,
    _layer_prefix: *const c_char,
    message: *const c_char,
    _user_data: *mut c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr(message).to_string_lossy();
    if flags.contains(vk::DebugReportFlagsEXT::ERROR) {
        tracing::error!("vulkan: {message}");
    } else if flags.contains(vk::DebugReportFlagsEXT::WARNING) {
        tracing::warn!("vulkan: {message}");
    } else {
        tracing::debug!("vulkan: {message}");
    }
    vk::FALSE
}

fn create_instance(entry: &ash::Entry, enable_validation: bool) -> GpuResult<ash::Instance> {
    let mut layers: Vec<*const c_char> = Vec::new();
    if enable_validation {
        let available = unsafe { entry.enumerate_instance_layer_properties()? };
        if !has_layer(&available, VALIDATION_LAYER) {
            return Err(GpuError::Driver(
                "validation requested but VK_LAYER_KHRONOS_validation is unavailable".into(),
            ));
        }
        layers.push(VALIDATION_LAYER.as_ptr());
    }

    let available = unsafe { entry.enumerate_instance_extension_properties(None)? };
    for required in INSTANCE_EXTENSIONS {
        if !has_extension(&available, required) {
            return Err(GpuError::Driver(format!(
                "missing instance extension {}",
                required.to_string_lossy()
            )));
        }
    }
    let extensions: Vec<*const c_char> =
        INSTANCE_EXTENSIONS.iter().map(|name| name.as_ptr()).collect();

    let app_info = vk::ApplicationInfo::default()
        .application_name(c"cassiad")
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(c"cassiad")
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(vk::API_VERSION_1_1);
    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_layer_names(&layers)
        .enabled_extension_names(&extensions);

    Ok(unsafe { entry.create_instance(&create_info, None)? })
}

fn select_queue_family(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> GpuResult<u32> {
    let families =
        unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
    families
        .iter()
        .position(|family| {
            family
                .queue_flags
                .contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
        })
        .map(|index| index as u32)
        .ok_or_else(|| GpuError::Driver("no graphics+compute queue family".into()))
}

fn create_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    queue_family_index: u32,
) -> GpuResult<ash::Device> {
    let available = unsafe { instance.enumerate_device_extension_properties(physical_device)? };
    for required in DEVICE_EXTENSIONS {
        if !has_extension(&available, required) {
            return Err(GpuError::Driver(format!(
                "missing device extension {}",
                required.to_string_lossy()
            )));
        }
    }
    let extensions: Vec<*const c_char> =
        DEVICE_EXTENSIONS.iter().map(|name| name.as_ptr()).collect();

    let priorities = [1.0f32];
    let queue_info = vk::DeviceQueueCreateInfo::default()
        .queue_family_index(queue_family_index)
        .queue_priorities(&priorities);
    let queue_infos = [queue_info];
    let create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_infos)
        .enabled_extension_names(&extensions);

    Ok(unsafe { instance.create_device(physical_device, &create_info, None)? })
}

impl VulkanDriver {
    pub fn new(enable_validation: bool) -> GpuResult<Self> {
        let entry =
            unsafe { ash::Entry::load() }.map_err(|e| GpuError::Driver(e.to_string()))?;
        let instance = create_instance(&entry, enable_validation)?;

        let debug_loader = ash::ext::debug_report::Instance::new(&entry, &instance);
        let debug_info = vk::DebugReportCallbackCreateInfoEXT::default()
            .flags(
                vk::DebugReportFlagsEXT::ERROR
                    | vk::DebugReportFlagsEXT::WARNING
                    | vk::DebugReportFlagsEXT::PERFORMANCE_WARNING,
            )
            .pfn_callback(Some(debug_report_callback));
        let debug_callback =
            unsafe { debug_loader.create_debug_report_callback(&debug_info, None)? };
        let debug = (debug_loader, debug_callback);

        let physical_device = *unsafe { instance.enumerate_physical_devices()? }
            .first()
            .ok_or_else(|| GpuError::Driver("no physical devices".into()))?;
        let queue_family_index = select_queue_family(&instance, physical_device)?;
        let device = create_device(&instance, physical_device, queue_family_index)?;
        let queue = unsafe { device.get_device_queue(queue_family_index, 0) };

        let khr_surface = ash::khr::surface::Instance::new(&entry, &instance);
        let khr_android_surface = ash::khr::android_surface::Instance::new(&entry, &instance);
        let khr_swapchain = ash::khr::swapchain::Device::new(&instance, &device);
        let khr_semaphore_fd = ash::khr::external_semaphore_fd::Device::new(&instance, &device);

        let command_pool = unsafe {
            device.create_command_pool(
                &vk::CommandPoolCreateInfo::default()
                    .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER),
                None,
            )?
        };
        let command_buffers = unsafe {
            device.allocate_command_buffers(
                &vk::CommandBufferAllocateInfo::default()
                    .command_pool(command_pool)
                    .level(vk::CommandBufferLevel::PRIMARY)
                    .command_buffer_count(FRAMES_IN_FLIGHT as u32),
            )?
        };

        let mut frames = Vec::with_capacity(FRAMES_IN_FLIGHT);
        for command_buffer in command_buffers {
            let image_acquired =
                unsafe { device.create_semaphore(&vk::SemaphoreCreateInfo::default(), None)? };
            // Exported to clients as their acquire fence each frame.
            let mut export = vk::ExportSemaphoreCreateInfo::default()
                .handle_types(vk::ExternalSemaphoreHandleTypeFlags::SYNC_FD);
            let client_present_done = unsafe {
                device.create_semaphore(
                    &vk::SemaphoreCreateInfo::default().push_next(&mut export),
                    None,
                )?
            };
            let composite_done = unsafe {
                device.create_fence(
                    &vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED),
                    None,
                )?
            };
            frames.push(FrameSlot {
                command_buffer,
                image_acquired,
                client_present_done,
                composite_done,
            });
        }

        tracing::info!(
            "vulkan context ready: queue family {queue_family_index}, validation {}",
            if enable_validation { "on" } else { "off" }
        );

        Ok(Self {
            _entry: entry,
            instance,
            debug,
            physical_device,
            device,
            queue,
            queue_lock: Mutex::new(()),
            khr_surface,
            khr_android_surface,
            khr_swapchain,
            khr_semaphore_fd,
            command_pool,
            frames,
            display: Mutex::new(None),
        })
    }

    fn destroy_display_locked(&self, display: VkDisplay) {
        unsafe {
            for semaphore in display.present_ready {
                self.device.destroy_semaphore(semaphore, None);
            }
            self.khr_swapchain.destroy_swapchain(display.swapchain, None);
            self.khr_surface.destroy_surface(display.surface, None);
        }
    }
}

impl GpuDriver for VulkanDriver {
    fn create_client_image(
        &self,
        format: i32,
        extent: Extent2d,
        usage: u32,
    ) -> GpuResult<ImageId> {
        let mut external = vk::ExternalMemoryImageCreateInfo::default()
            .handle_types(vk::ExternalMemoryHandleTypeFlags::ANDROID_HARDWARE_BUFFER_ANDROID);
        let info = vk::ImageCreateInfo::default()
            .push_next(&mut external)
            .image_type(vk::ImageType::TYPE_2D)
            .format(vk::Format::from_raw(format))
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(vk::ImageUsageFlags::from_raw(usage) | vk::ImageUsageFlags::TRANSFER_SRC)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = unsafe { self.device.create_image(&info, None)? };
        Ok(ImageId(image.as_raw()))
    }

    #[cfg(target_os = "android")]
    fn allocate_platform_buffer(
        &self,
        format: i32,
        extent: Extent2d,
    ) -> GpuResult<PlatformBufferId> {
        let backing_format =
            platform_buffer_format(format).ok_or(GpuError::UnsupportedFormat(format))?;
        let desc = ndk_sys::AHardwareBuffer_Desc {
            width: extent.width,
            height: extent.height,
            layers: 1,
            format: backing_format,
            usage: ndk_sys::AHardwareBuffer_UsageFlags::AHARDWAREBUFFER_USAGE_GPU_SAMPLED_IMAGE.0
                | ndk_sys::AHardwareBuffer_UsageFlags::AHARDWAREBUFFER_USAGE_GPU_COLOR_OUTPUT.0
                | ndk_sys::AHardwareBuffer_UsageFlags::AHARDWAREBUFFER_USAGE_CPU_READ_NEVER.0
                | ndk_sys::AHardwareBuffer_UsageFlags::AHARDWAREBUFFER_USAGE_CPU_WRITE_NEVER.0,
            stride: 0,
            rfu0: 0,
            rfu1: 0,
        };
        let mut buffer = std::ptr::null_mut();
        let rc = unsafe { ndk_sys::AHardwareBuffer_allocate(&desc, &mut buffer) };
        if rc != 0 || buffer.is_null() {
            return Err(GpuError::Driver(format!(
                "AHardwareBuffer_allocate failed: {rc}"
            )));
        }
        Ok(PlatformBufferId(buffer as u64))
    }

    #[cfg(not(target_os = "android"))]
    fn allocate_platform_buffer(
        &self,
        format: i32,
        _extent: Extent2d,
    ) -> GpuResult<PlatformBufferId> {
        platform_buffer_format(format).ok_or(GpuError::UnsupportedFormat(format))?;
        Err(GpuError::PlatformBufferUnsupported)
    }

    #[cfg(target_os = "android")]
    fn send_platform_buffer(&self, buffer: PlatformBufferId, socket: RawFd) -> GpuResult<()> {
        let rc = unsafe {
            ndk_sys::AHardwareBuffer_sendHandleToUnixSocket(
                buffer.0 as *const ndk_sys::AHardwareBuffer,
                socket,
            )
        };
        if rc != 0 {
            return Err(GpuError::Driver(format!(
                "AHardwareBuffer_sendHandleToUnixSocket failed: {rc}"
            )));
        }
        Ok(())
    }

    #[cfg(not(target_os = "android"))]
    fn send_platform_buffer(&self, _buffer: PlatformBufferId, _socket: RawFd) -> GpuResult<()> {
        Err(GpuError::PlatformBufferUnsupported)
    }

    fn import_platform_buffer(
        &self,
        image: ImageId,
        buffer: PlatformBufferId,
    ) -> GpuResult<MemoryId> {
        let image = vk::Image::from_raw(image.0);
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };
        let mut import = vk::ImportAndroidHardwareBufferInfoANDROID::default()
            .buffer(buffer.0 as *mut vk::AHardwareBuffer);
        let info = vk::MemoryAllocateInfo::default()
            .push_next(&mut import)
            .allocation_size(requirements.size)
            .memory_type_index(0);
        let memory = unsafe { self.device.allocate_memory(&info, None)? };
        if let Err(e) = unsafe { self.device.bind_image_memory(image, memory, 0) } {
            unsafe { self.device.free_memory(memory, None) };
            return Err(e.into());
        }
        Ok(MemoryId(memory.as_raw()))
    }

    fn create_semaphore(&self) -> GpuResult<SemaphoreId> {
        let semaphore = unsafe {
            self.device
                .create_semaphore(&vk::SemaphoreCreateInfo::default(), None)?
        };
        Ok(SemaphoreId(semaphore.as_raw()))
    }

    fn import_semaphore_sync_fd(&self, semaphore: SemaphoreId, fd: RawFd) -> GpuResult<()> {
        let info = vk::ImportSemaphoreFdInfoKHR::default()
            .semaphore(vk::Semaphore::from_raw(semaphore.0))
            .flags(vk::SemaphoreImportFlags::TEMPORARY)
            .handle_type(vk::ExternalSemaphoreHandleTypeFlags::SYNC_FD)
            .fd(fd);
        match unsafe { self.khr_semaphore_fd.import_semaphore_fd(&info) } {
            // A successful import takes ownership of the descriptor.
            Ok(()) => Ok(()),
            Err(e) => {
                close_raw(fd);
                Err(e.into())
            }
        }
    }

    fn destroy_image(&self, image: ImageId) {
        unsafe { self.device.destroy_image(vk::Image::from_raw(image.0), None) };
    }

    fn free_memory(&self, memory: MemoryId) {
        unsafe {
            self.device
                .free_memory(vk::DeviceMemory::from_raw(memory.0), None)
        };
    }

    #[cfg(target_os = "android")]
    fn release_platform_buffer(&self, buffer: PlatformBufferId) {
        unsafe { ndk_sys::AHardwareBuffer_release(buffer.0 as *mut ndk_sys::AHardwareBuffer) };
    }

    #[cfg(not(target_os = "android"))]
    fn release_platform_buffer(&self, _buffer: PlatformBufferId) {}

    fn destroy_semaphore(&self, semaphore: SemaphoreId) {
        unsafe {
            self.device
                .destroy_semaphore(vk::Semaphore::from_raw(semaphore.0), None)
        };
    }

    fn create_display_swapchain(&self, window: WindowHandle) -> GpuResult<Extent2d> {
        let mut display = self.display.lock().unwrap();
        if let Some(old) = display.take() {
            self.wait_idle();
            self.destroy_display_locked(old);
        }

        let surface = unsafe {
            self.khr_android_surface.create_android_surface(
                &vk::AndroidSurfaceCreateInfoKHR::default()
                    .window(window.0 as *mut vk::ANativeWindow),
                None,
            )?
        };
        let caps = unsafe {
            self.khr_surface
                .get_physical_device_surface_capabilities(self.physical_device, surface)?
        };

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface)
            .min_image_count(FRAMES_IN_FLIGHT as u32)
            .image_format(vk::Format::R8G8B8A8_UNORM)
            .image_color_space(vk::ColorSpaceKHR::SRGB_NONLINEAR)
            .image_extent(caps.current_extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(vk::SurfaceTransformFlagsKHR::IDENTITY)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::INHERIT)
            .present_mode(vk::PresentModeKHR::FIFO)
            .clipped(true);
        let swapchain = unsafe { self.khr_swapchain.create_swapchain(&create_info, None)? };
        let images = unsafe { self.khr_swapchain.get_swapchain_images(swapchain)? };
        if images.len() > MAX_SWAPCHAIN_IMAGES {
            unsafe {
                self.khr_swapchain.destroy_swapchain(swapchain, None);
                self.khr_surface.destroy_surface(surface, None);
            }
            return Err(GpuError::Driver(format!(
                "platform swapchain returned {} images",
                images.len()
            )));
        }
        let mut present_ready = Vec::with_capacity(images.len());
        for _ in &images {
            present_ready.push(unsafe {
                self.device
                    .create_semaphore(&vk::SemaphoreCreateInfo::default(), None)?
            });
        }

        *display = Some(VkDisplay {
            surface,
            swapchain,
            images,
            present_ready,
        });
        Ok(Extent2d::new(caps.current_extent.width, caps.current_extent.height))
    }

    fn destroy_display_swapchain(&self) {
        if let Some(display) = self.display.lock().unwrap().take() {
            self.destroy_display_locked(display);
        }
    }

    fn begin_frame(&self, slot: usize) -> GpuResult<()> {
        let frame = &self.frames[slot];
        unsafe {
            self.device
                .wait_for_fences(&[frame.composite_done], true, u64::MAX)?;
            self.device.reset_fences(&[frame.composite_done])?;
            self.device.begin_command_buffer(
                frame.command_buffer,
                &vk::CommandBufferBeginInfo::default()
                    .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
            )?;
        }
        Ok(())
    }

    fn acquire_display_image(&self, slot: usize) -> GpuResult<u32> {
        let display = self.display.lock().unwrap();
        let display = display.as_ref().ok_or(GpuError::NoSwapchain)?;
        match unsafe {
            self.khr_swapchain.acquire_next_image(
                display.swapchain,
                u64::MAX,
                self.frames[slot].image_acquired,
                vk::Fence::null(),
            )
        } {
            Ok((index, _suboptimal)) => Ok(index),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Err(GpuError::OutOfDate),
            Err(e) => Err(e.into()),
        }
    }

    fn record_display_layout_transition(&self, slot: usize) {
        let display = self.display.lock().unwrap();
        let Some(display) = display.as_ref() else {
            return;
        };
        let barriers: Vec<vk::ImageMemoryBarrier> = display
            .images
            .iter()
            .map(|&image| {
                vk::ImageMemoryBarrier::default()
                    .old_layout(vk::ImageLayout::UNDEFINED)
                    .new_layout(vk::ImageLayout::PRESENT_SRC_KHR)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .image(image)
                    .subresource_range(
                        vk::ImageSubresourceRange::default()
                            .aspect_mask(vk::ImageAspectFlags::COLOR)
                            .level_count(1)
                            .layer_count(1),
                    )
            })
            .collect();
        unsafe {
            self.device.cmd_pipeline_barrier(
                self.frames[slot].command_buffer,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &barriers,
            );
        }
    }

    fn record_blit(
        &self,
        slot: usize,
        src: ImageId,
        src_extent: Extent2d,
        display_image: u32,
        dst_extent: Extent2d,
    ) {
        let display = self.display.lock().unwrap();
        let Some(display) = display.as_ref() else {
            return;
        };
        let command_buffer = self.frames[slot].command_buffer;

        // The previous frame's blit may still be writing the same client
        // buffer when the client has not advanced; order transfer writes
        // against this frame's reads and writes.
        let barrier = vk::MemoryBarrier::default()
            .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .dst_access_mask(vk::AccessFlags::TRANSFER_READ | vk::AccessFlags::TRANSFER_WRITE);
        let subresource = vk::ImageSubresourceLayers::default()
            .aspect_mask(vk::ImageAspectFlags::COLOR)
            .mip_level(0)
            .base_array_layer(0)
            .layer_count(1);
        let blit = vk::ImageBlit::default()
            .src_subresource(subresource)
            .src_offsets([
                vk::Offset3D { x: 0, y: 0, z: 0 },
                vk::Offset3D {
                    x: src_extent.width as i32,
                    y: src_extent.height as i32,
                    z: 1,
                },
            ])
            .dst_subresource(subresource)
            .dst_offsets([
                vk::Offset3D { x: 0, y: 0, z: 0 },
                vk::Offset3D {
                    x: dst_extent.width as i32,
                    y: dst_extent.height as i32,
                    z: 1,
                },
            ]);
        unsafe {
            self.device.cmd_pipeline_barrier(
                command_buffer,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[barrier],
                &[],
                &[],
            );
            self.device.cmd_blit_image(
                command_buffer,
                vk::Image::from_raw(src.0),
                vk::ImageLayout::GENERAL,
                display.images[display_image as usize],
                vk::ImageLayout::PRESENT_SRC_KHR,
                &[blit],
                vk::Filter::NEAREST,
            );
        }
    }

    fn submit_and_present(
        &self,
        slot: usize,
        display_image: u32,
        waits: &[SemaphoreId],
    ) -> GpuResult<()> {
        let display = self.display.lock().unwrap();
        let display = display.as_ref().ok_or(GpuError::NoSwapchain)?;
        let frame = &self.frames[slot];

        unsafe { self.device.end_command_buffer(frame.command_buffer)? };

        let mut wait_semaphores = Vec::with_capacity(waits.len() + 1);
        wait_semaphores.push(frame.image_acquired);
        wait_semaphores.extend(waits.iter().map(|s| vk::Semaphore::from_raw(s.0)));
        let wait_stages =
            vec![vk::PipelineStageFlags::ALL_COMMANDS; wait_semaphores.len()];
        let present_ready = display.present_ready[display_image as usize];
        let signal_semaphores = [frame.client_present_done, present_ready];
        let command_buffers = [frame.command_buffer];
        let submit = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        let swapchains = [display.swapchain];
        let image_indices = [display_image];
        let present_waits = [present_ready];
        let present = vk::PresentInfoKHR::default()
            .wait_semaphores(&present_waits)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let _queue = self.queue_lock.lock().unwrap();
        unsafe {
            self.device
                .queue_submit(self.queue, &[submit], frame.composite_done)?;
        }
        match unsafe { self.khr_swapchain.queue_present(self.queue, &present) } {
            Ok(_suboptimal) => Ok(()),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Err(GpuError::OutOfDate),
            Err(e) => Err(e.into()),
        }
    }

    fn export_present_fence(&self, slot: usize) -> GpuResult<RawFd> {
        let info = vk::SemaphoreGetFdInfoKHR::default()
            .semaphore(self.frames[slot].client_present_done)
            .handle_type(vk::ExternalSemaphoreHandleTypeFlags::SYNC_FD);
        Ok(unsafe { self.khr_semaphore_fd.get_semaphore_fd(&info)? })
    }

    fn wait_idle(&self) {
        let _queue = self.queue_lock.lock().unwrap();
        let _ = unsafe { self.device.device_wait_idle() };
    }
}

impl Drop for VulkanDriver {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            if let Some(display) = self.display.lock().unwrap().take() {
                self.destroy_display_locked(display);
            }
            for frame in &self.frames {
                self.device.destroy_semaphore(frame.image_acquired, None);
                self.device.destroy_semaphore(frame.client_present_done, None);
                self.device.destroy_fence(frame.composite_done, None);
            }
            self.device.destroy_command_pool(self.command_pool, None);
            self.device.destroy_device(None);
            let (loader, callback) = &self.debug;
            loader.destroy_debug_report_callback(*callback, None);
            self.instance.destroy_instance(None);
        }
    }
}
