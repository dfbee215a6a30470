//! The command processor: frame lifecycle, swapchain recreation and the
//! batch entry points used by the front end.

use std::num::NonZeroUsize;
use std::sync::Arc;

use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use vkproc_core::{BackendConfig, Command, CommandKind, MemoryUsage};
use vkproc_gpu::capabilities::resolve_sample_count;
use vkproc_gpu::command::{begin_primary, end_command_buffer, submit_command_buffers};
use vkproc_gpu::descriptors::DEFAULT_POOL_CHUNK;
use vkproc_gpu::error::{classify_result, VkFailure};
use vkproc_gpu::swapchain::{select_present_mode, select_surface_format, swap_extent};
use vkproc_gpu::{
    AdapterSelection, CommandPool, DescriptorPoolSet, DeviceFence, FrameFence, FrameSemaphores,
    GpuContext, GpuContextBuilder, GpuError, RenderTargets, SwapExtent, Swapchain,
};

use crate::buffer::BufferObjects;
use crate::dispatch::{is_render_command, Assignment, RunCommandResult, ThreadAssigner};
use crate::error::{BackendError, ErrorKind, ErrorState, Result};
use crate::execute::{ExecuteBuffer, ViewportState};
use crate::frame::FrameTracker;
use crate::memory::MemoryManager;
use crate::pipelines::{DescriptorLayouts, Pipelines, ShaderSource};
use crate::recorder::{FrameTarget, ThreadRecorders};
use crate::stream::StreamBuffers;
use crate::texture::{Samplers, TextureDescriptors, TextureTable, UploadTarget};
use crate::workers::{Recorder, WorkerPool};

/// Vulkan implementation of the command processor.
///
/// Commands arrive in batches: [`Self::start_commands`], any number of
/// [`Self::run_command`] calls, then [`Self::end_commands`]. Render commands
/// are filled into execute buffers on the calling thread and recorded into
/// secondary command buffers by the worker threads; everything else runs
/// immediately.
pub struct VulkanBackend {
    pub(crate) context: Arc<GpuContext>,
    pub(crate) config: BackendConfig,
    shaders: Box<dyn ShaderSource>,
    pub(crate) errors: Arc<ErrorState>,
    pub(crate) usage: MemoryUsage,

    pub(crate) memory: MemoryManager,
    pub(crate) textures: TextureTable,
    pub(crate) buffers: BufferObjects,
    pub(crate) streams: StreamBuffers,
    layouts: DescriptorLayouts,
    pub(crate) pipelines: Option<Pipelines>,

    recorders: Arc<ThreadRecorders>,
    workers: Option<WorkerPool<ThreadRecorders>>,
    assigner: ThreadAssigner,

    pub(crate) swapchain: Option<Swapchain>,
    targets: Option<RenderTargets>,
    pub(crate) viewport: ViewportState,
    frames: FrameTracker<DeviceFence>,
    semaphores: Vec<FrameSemaphores>,

    pub(crate) command_pool: CommandPool,
    draw_buffers: Vec<vk::CommandBuffer>,
    memory_buffers: Vec<vk::CommandBuffer>,
    memory_begun: Vec<bool>,

    pub(crate) image_index: usize,
    frame_begun: bool,
    pub(crate) frame_has_draws: bool,
    rendering_paused: bool,
    pub(crate) recreate_requested: bool,
    pub(crate) clear_color: [f32; 4],
    sequence: u64,
    pub(crate) canvas: vk::Extent2D,
    pub(crate) vsync: bool,
    pub(crate) samples: u32,
    pub(crate) last_presented: Option<usize>,
}

impl VulkanBackend {
    /// Create a device for `window` and initialize the backend on it.
    pub fn for_window<W>(window: &W, config: BackendConfig, shaders: Box<dyn ShaderSource>) -> Result<Self>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let context = GpuContextBuilder::from_config(&config).build_for_window(window)?;
        Self::new(Arc::new(context), config, shaders)
    }

    /// Initialize the backend on a device with a presentation surface.
    ///
    /// Failures are recorded as init warnings in [`Self::error_state`] of
    /// the returned error's context and the backend is not created.
    pub fn new(context: Arc<GpuContext>, config: BackendConfig, shaders: Box<dyn ShaderSource>) -> Result<Self> {
        let errors = Arc::new(ErrorState::new());
        match Self::init(context, config, shaders, Arc::clone(&errors)) {
            Ok(backend) => {
                errors.set_can_assert(true);
                Ok(backend)
            }
            Err(err) => {
                errors.set_error(ErrorKind::Init, "Failed to initialize the vulkan backend", Some(&err.to_string()));
                Err(err)
            }
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn init(
        context: Arc<GpuContext>,
        config: BackendConfig,
        shaders: Box<dyn ShaderSource>,
        errors: Arc<ErrorState>,
    ) -> Result<Self> {
        let device = context.device_arc();
        let hardware_threads = std::thread::available_parallelism().map_or(1, NonZeroUsize::get);
        let thread_count = config.effective_thread_count(hardware_threads);

        let surface = context
            .surface()
            .ok_or_else(|| GpuError::InvalidState("the backend needs a presentation surface".into()))?;
        let surface_caps = surface.capabilities(context.physical_device())?;
        let frame_slots = vkproc_gpu::swapchain::image_count(&surface_caps.capabilities) as usize;

        let usage = MemoryUsage::new();
        let memory = MemoryManager::new(Arc::clone(&context), usage.clone(), frame_slots);
        let limits = *memory.limits();

        // SAFETY: the device is valid for the lifetime of the backend; every
        // object created here is destroyed in `Drop`.
        let layouts = unsafe { DescriptorLayouts::new(&device)? };
        let samplers = unsafe { Samplers::new(&device, context.features(), &limits, config.lod_bias())? };
        let descriptors = TextureDescriptors {
            standard_layout: layouts.standard,
            text_layout: layouts.text,
            standard_pool: DescriptorPoolSet::new(
                0,
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                DEFAULT_POOL_CHUNK,
            ),
            text_pool: DescriptorPoolSet::new(
                1,
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                DEFAULT_POOL_CHUNK,
            )
            .with_descriptors_per_set(2),
        };
        let textures = TextureTable::new(
            Arc::clone(&device),
            samplers,
            descriptors,
            &limits,
            context.features(),
            frame_slots,
        );
        let buffers = BufferObjects::new(Arc::clone(&device));
        let streams = StreamBuffers::new(
            Arc::clone(&device),
            layouts.uniform,
            thread_count,
            frame_slots,
            |thread| {
                DescriptorPoolSet::new(
                    2 + thread as u32,
                    vk::DescriptorType::UNIFORM_BUFFER,
                    DEFAULT_POOL_CHUNK,
                )
            },
        );

        let queue_family = context.graphics_queue_family();
        let recorders = Arc::new(unsafe {
            ThreadRecorders::new(Arc::clone(&device), queue_family, thread_count, frame_slots)?
        });
        let workers = if thread_count > 1 {
            Some(WorkerPool::new(thread_count - 1, Arc::clone(&recorders), Arc::clone(&errors))?)
        } else {
            None
        };

        let command_pool = unsafe { CommandPool::new(&device, queue_family)? };
        let draw_buffers =
            unsafe { command_pool.allocate(&device, vk::CommandBufferLevel::PRIMARY, frame_slots as u32)? };
        let memory_buffers =
            unsafe { command_pool.allocate(&device, vk::CommandBufferLevel::PRIMARY, frame_slots as u32)? };
        let frames = FrameTracker::new(create_fences(&device, frame_slots)?);
        let semaphores = create_semaphores(&device, frame_slots)?;

        let canvas = vk::Extent2D {
            width: config.canvas_width,
            height: config.canvas_height,
        };
        let vsync = config.vsync;
        let samples = config.even_multisampling();

        let mut backend = Self {
            context,
            config,
            shaders,
            errors,
            usage,
            memory,
            textures,
            buffers,
            streams,
            layouts,
            pipelines: None,
            recorders,
            workers,
            assigner: ThreadAssigner::new(thread_count.saturating_sub(1)),
            swapchain: None,
            targets: None,
            viewport: ViewportState::new(SwapExtent {
                swap_image: canvas,
                forced_viewport: canvas,
                has_forced_viewport: false,
            }),
            frames,
            semaphores,
            command_pool,
            draw_buffers,
            memory_buffers,
            memory_begun: vec![false; frame_slots],
            image_index: 0,
            frame_begun: false,
            frame_has_draws: false,
            rendering_paused: false,
            recreate_requested: true,
            clear_color: [0.0, 0.0, 0.0, 1.0],
            sequence: 0,
            canvas,
            vsync,
            samples,
            last_presented: None,
        };

        backend.prepare_frame()?;
        let target = backend.upload_target()?;
        backend.buffers.create_index_buffers(&mut backend.memory, target)?;

        tracing::info!(
            "vulkan backend ready on {}: {} recording threads, {} frame slots",
            backend.context.adapter().name,
            thread_count,
            backend.frames.image_count()
        );
        Ok(backend)
    }

    /// Sticky error and warning state shared with the recording threads.
    pub const fn error_state(&self) -> &Arc<ErrorState> {
        &self.errors
    }

    pub const fn memory_usage(&self) -> &MemoryUsage {
        &self.usage
    }

    /// Usable adapters and the one that was picked.
    pub fn adapters(&self) -> &AdapterSelection {
        self.context.adapter_selection()
    }

    pub fn adapter_name(&self) -> &str {
        &self.context.adapter().name
    }

    /// Whether presentation is paused because the surface was lost.
    pub const fn is_rendering_paused(&self) -> bool {
        self.rendering_paused
    }

    pub const fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// Begin a batch of `command_count` commands.
    pub fn start_commands(&mut self, command_count: usize) {
        self.assigner.start_batch(command_count);
    }

    /// Run one command of the current batch.
    pub fn run_command(&mut self, command: &Command) -> RunCommandResult {
        if self.errors.has_error() {
            return RunCommandResult::Error;
        }
        let assignment = self.assigner.next(is_render_command(command.kind()));
        match self.dispatch(command, assignment) {
            Ok(result) => result,
            Err(err) if err.is_out_of_memory() => self.retry_after_out_of_memory(command, assignment, &err),
            Err(err) => {
                self.report(command.kind(), &err);
                RunCommandResult::Error
            }
        }
    }

    /// Finish the batch; every worker has recorded its slice on return.
    pub fn end_commands(&mut self) {
        if let Some(workers) = &mut self.workers {
            workers.finish();
        }
    }

    /// Run a command at the batch position it was assigned.
    fn dispatch(&mut self, command: &Command, assignment: Assignment) -> Result<RunCommandResult> {
        if is_render_command(command.kind()) {
            self.record_render(command, assignment)?;
            Ok(RunCommandResult::Handled)
        } else {
            self.execute_command(command)
        }
    }

    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    fn record_render(&mut self, command: &Command, assignment: Assignment) -> Result<()> {
        if self.frame_begun {
            let mut buffer = ExecuteBuffer::new(command.kind(), self.sequence, assignment.thread_index);
            self.sequence += 1;
            self.fill_execute_buffer(command, &mut buffer)?;
            if !buffer.steps.is_empty() {
                self.frame_has_draws = true;
                match &self.workers {
                    Some(workers) if buffer.thread_index > 0 => workers.enqueue(buffer.thread_index, buffer),
                    _ => self.recorders.record(0, &buffer)?,
                }
            }
        }
        if let (Some(worker), Some(workers)) = (assignment.wake, &mut self.workers) {
            workers.wake(worker);
        }
        Ok(())
    }

    /// Flush every pending free by cycling through the swap images, then retry once.
    ///
    /// The retry keeps the command's original assignment.
    fn retry_after_out_of_memory(
        &mut self,
        command: &Command,
        assignment: Assignment,
        first: &BackendError,
    ) -> RunCommandResult {
        let kind = command.kind();
        tracing::warn!("{kind:?} ran out of memory, flushing pending frees: {first}");
        for _ in 0..=self.frames.image_count() {
            if let Err(err) = self.next_frame() {
                self.report(kind, &err);
                return RunCommandResult::Error;
            }
        }
        self.memory.shrink();

        match self.dispatch(command, assignment) {
            Ok(result) => result,
            Err(err) => {
                let err = if err.is_out_of_memory() {
                    BackendError::OutOfMemory {
                        reason: err.to_string(),
                        usage: self.usage.summary(),
                    }
                } else {
                    err
                };
                self.report(kind, &err);
                RunCommandResult::Error
            }
        }
    }

    fn report(&self, kind: CommandKind, err: &BackendError) {
        self.errors.set_error(
            error_kind_for(kind, err),
            &format!("{kind:?} failed"),
            Some(&err.to_string()),
        );
    }

    /// The memory command buffer of the current frame slot, begun on first use.
    pub(crate) fn upload_target(&mut self) -> Result<UploadTarget> {
        let slot = self.image_index;
        let cmd = *self
            .memory_buffers
            .get(slot)
            .ok_or_else(|| GpuError::InvalidState(format!("no memory command buffer for slot {slot}")))?;
        if !self.memory_begun[slot] {
            if !self.frame_begun {
                // The slot's last submission may still be in flight.
                self.frames.wait_all()?;
            }
            // SAFETY: the slot's previous submission has completed.
            unsafe { begin_primary(self.context.device(), cmd)? };
            self.memory_begun[slot] = true;
        }
        Ok(UploadTarget { cmd, frame_slot: slot })
    }

    /// Present the current frame, if any, and start the next one.
    pub(crate) fn next_frame(&mut self) -> Result<()> {
        if self.rendering_paused {
            return Ok(());
        }
        if self.frame_begun {
            self.submit_frame()?;
        }
        self.prepare_frame()
    }

    /// Submit the current frame and wait until the GPU has finished it.
    pub fn wait_frame(&mut self) -> Result<()> {
        if self.frame_begun && !self.rendering_paused {
            self.submit_frame()?;
        }
        Ok(self.frames.wait_all()?)
    }

    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    fn prepare_frame(&mut self) -> Result<()> {
        if self.rendering_paused {
            return Ok(());
        }
        if !self.frame_begun && self.memory_begun.get(self.image_index).copied().unwrap_or(false) {
            self.pure_memory_frame()?;
        }
        if self.recreate_requested {
            self.recreate_swapchain()?;
            if self.recreate_requested {
                return Ok(());
            }
        }

        self.frames.current_fence().wait()?;
        let semaphore = self.semaphores[self.frames.sync_slot()].image_acquired;

        let mut retried = false;
        let image = loop {
            let loader = self.context.swapchain_loader()?;
            let swapchain = self
                .swapchain
                .as_ref()
                .ok_or_else(|| GpuError::InvalidState("no swapchain".into()))?;
            // SAFETY: the semaphore is unsignaled; its last wait was submitted with the slot's fence.
            match unsafe { swapchain.acquire_next_image(loader, semaphore) } {
                Ok((image, suboptimal)) => {
                    if suboptimal {
                        self.recreate_requested = true;
                    }
                    break image as usize;
                }
                Err(result) => match classify_result(result) {
                    VkFailure::RecreateSwapchain if !retried => {
                        retried = true;
                        self.recreate_swapchain()?;
                        if self.recreate_requested {
                            return Ok(());
                        }
                    }
                    VkFailure::SurfaceLost => {
                        tracing::warn!("surface lost, pausing rendering");
                        self.rendering_paused = true;
                        return Ok(());
                    }
                    failure => {
                        let message = failure
                            .critical_message()
                            .unwrap_or_else(|| format!("{result:?}"));
                        self.errors
                            .set_error(ErrorKind::SwapFailed, "Failed to acquire the next image", Some(&message));
                        return Err(GpuError::from(result).into());
                    }
                },
            }
        };

        let mut stale = Vec::new();
        self.frames.begin_image(image, |other| stale.push(other))?;
        for slot in stale {
            self.clear_frame_slot(slot);
        }
        self.clear_frame_slot(image);

        self.image_index = image;
        self.frame_begun = true;
        self.frame_has_draws = false;
        let targets = self
            .targets
            .as_ref()
            .ok_or_else(|| GpuError::InvalidState("no render targets".into()))?;
        self.recorders.set_target(FrameTarget {
            render_pass: targets.render_pass,
            framebuffer: targets.framebuffers[image],
            frame_slot: image,
            extent: self.viewport.extent().swap_image,
        });
        self.assigner.reset_slices();
        Ok(())
    }

    fn clear_frame_slot(&mut self, slot: usize) {
        self.textures.clear_frame(&mut self.memory, slot);
        self.streams.reset(slot);
        self.memory.cleanup(slot);
    }

    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    fn submit_frame(&mut self) -> Result<()> {
        if let Some(workers) = &mut self.workers {
            workers.finish();
        }
        let secondaries = self.recorders.collect()?;
        let slot = self.image_index;
        let device = self.context.device();
        let draw = self.draw_buffers[slot];
        let targets = self
            .targets
            .as_ref()
            .ok_or_else(|| GpuError::InvalidState("no render targets".into()))?;
        let clear_values = [vk::ClearValue {
            color: vk::ClearColorValue {
                float32: self.clear_color,
            },
        }];
        let render_area = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: self.viewport.extent().swap_image,
        };
        let pass_info = vk::RenderPassBeginInfo::default()
            .render_pass(targets.render_pass)
            .framebuffer(targets.framebuffers[slot])
            .render_area(render_area)
            .clear_values(&clear_values);

        // SAFETY: the draw buffer's last submission was waited on in `prepare_frame`
        // and every secondary buffer was recorded against this render pass.
        unsafe {
            begin_primary(device, draw)?;
            device.cmd_begin_render_pass(draw, &pass_info, vk::SubpassContents::SECONDARY_COMMAND_BUFFERS);
            if !secondaries.is_empty() {
                device.cmd_execute_commands(draw, &secondaries);
            }
            device.cmd_end_render_pass(draw);
            end_command_buffer(device, draw)?;
        }

        let mut submitted = Vec::with_capacity(2);
        if self.memory_begun[slot] {
            // SAFETY: the memory buffer is recording.
            unsafe { end_command_buffer(device, self.memory_buffers[slot])? };
            self.memory_begun[slot] = false;
            submitted.push(self.memory_buffers[slot]);
        }
        submitted.push(draw);

        let semaphores = &self.semaphores[self.frames.sync_slot()];
        let fence = self.frames.current_fence();
        fence.reset()?;
        // SAFETY: every handle belongs to this device and the fence is unsignaled.
        let submitted = unsafe {
            submit_command_buffers(
                device,
                self.context.graphics_queue(),
                &submitted,
                &[semaphores.image_acquired],
                &[vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT],
                &[semaphores.render_finished],
                fence.handle(),
            )
        };
        if let Err(result) = submitted {
            let message = classify_result(result)
                .critical_message()
                .unwrap_or_else(|| format!("{result:?}"));
            self.errors
                .set_error(ErrorKind::RenderSubmit, "Submitting the frame failed", Some(&message));
            return Err(GpuError::from(result).into());
        }

        let render_finished = semaphores.render_finished;
        let swapchain = self
            .swapchain
            .as_ref()
            .ok_or_else(|| GpuError::InvalidState("no swapchain".into()))?;
        let loader = self.context.swapchain_loader()?;
        // SAFETY: the image was acquired in `prepare_frame`.
        let presented = unsafe {
            swapchain.present(loader, self.context.graphics_queue(), slot as u32, &[render_finished])
        };
        self.frame_begun = false;
        self.frame_has_draws = false;
        self.frames.advance();
        match presented {
            Ok(suboptimal) => {
                if suboptimal {
                    self.recreate_requested = true;
                }
                self.last_presented = Some(slot);
            }
            Err(result) => match classify_result(result) {
                VkFailure::RecreateSwapchain => self.recreate_requested = true,
                VkFailure::SurfaceLost => {
                    tracing::warn!("surface lost while presenting, pausing rendering");
                    self.rendering_paused = true;
                }
                failure => {
                    let message = failure
                        .critical_message()
                        .unwrap_or_else(|| format!("{result:?}"));
                    self.errors
                        .set_error(ErrorKind::SwapFailed, "Presenting the frame failed", Some(&message));
                    return Err(GpuError::from(result).into());
                }
            },
        }
        Ok(())
    }

    /// Submit pending uploads outside of a frame and wait for them.
    fn pure_memory_frame(&mut self) -> Result<()> {
        let slot = self.image_index;
        if !self.memory_begun.get(slot).copied().unwrap_or(false) {
            return Ok(());
        }
        let device = self.context.device();
        let cmd = self.memory_buffers[slot];
        self.memory_begun[slot] = false;
        // SAFETY: the buffer is recording and the queue is idled before it is reused.
        unsafe {
            end_command_buffer(device, cmd)?;
            submit_command_buffers(
                device,
                self.context.graphics_queue(),
                &[cmd],
                &[],
                &[],
                &[],
                vk::Fence::null(),
            )
            .map_err(GpuError::from)?;
            device
                .queue_wait_idle(self.context.graphics_queue())
                .map_err(GpuError::from)?;
        }
        Ok(())
    }

    /// Rebuild the swapchain, render targets and pipelines.
    ///
    /// A zero-sized surface leaves `recreate_requested` set and changes nothing.
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn recreate_swapchain(&mut self) -> Result<()> {
        if let Some(workers) = &mut self.workers {
            workers.finish();
        }
        self.recorders.discard();
        self.pure_memory_frame()?;
        self.context.wait_idle()?;
        self.frame_begun = false;

        let surface = self
            .context
            .surface()
            .ok_or_else(|| GpuError::InvalidState("no presentation surface".into()))?;
        let caps = surface.capabilities(self.context.physical_device())?;
        if caps.is_zero_sized() {
            tracing::debug!("surface is zero-sized, deferring swapchain recreation");
            self.recreate_requested = true;
            return Ok(());
        }

        let extent = swap_extent(&caps.capabilities, self.canvas.width, self.canvas.height);
        let present_mode = select_present_mode(self.vsync, &caps.present_modes);
        let format = select_surface_format(&caps.formats);
        let samples = resolve_sample_count(self.samples, self.context.adapter().limits.color_sample_counts);

        let device = self.context.device();
        let loader = self.context.swapchain_loader()?;
        if let Some(mut pipelines) = self.pipelines.take() {
            pipelines.destroy();
        }
        if let Some(mut targets) = self.targets.take() {
            // SAFETY: the device is idle.
            unsafe { targets.destroy(device, &mut self.context.allocator().lock()) };
        }

        let old = self.swapchain.take();
        // SAFETY: the old swapchain is retired by the new one and destroyed after it.
        let created = unsafe {
            Swapchain::new(
                device,
                loader,
                surface.surface,
                &caps.capabilities,
                format,
                present_mode,
                extent,
                old.as_ref().map_or(vk::SwapchainKHR::null(), |old| old.swapchain),
            )
        };
        if let Some(old) = old {
            // SAFETY: the device is idle and nothing references the old images.
            unsafe { old.destroy(device, loader) };
        }
        let swapchain = created?;

        // SAFETY: the swapchain was just created on this device.
        let targets = unsafe {
            RenderTargets::new(device, &mut self.context.allocator().lock(), &swapchain, samples)?
        };
        let pipelines = unsafe {
            Pipelines::new(
                self.context.device_arc(),
                self.shaders.as_ref(),
                &self.layouts,
                targets.render_pass,
                samples,
                extent.swap_image,
            )
        };
        let image_count = swapchain.image_count();
        self.swapchain = Some(swapchain);
        self.targets = Some(targets);
        self.pipelines = Some(pipelines?);

        if image_count != self.frames.image_count() {
            self.set_frame_slots(image_count)?;
        }
        let device = self.context.device_arc();
        self.frames.reset(create_fences(&device, image_count)?);
        for semaphores in self.semaphores.drain(..) {
            // SAFETY: the device is idle.
            unsafe { semaphores.destroy(&device) };
        }
        self.semaphores = create_semaphores(&device, image_count)?;

        self.viewport.set_extent(extent);
        self.recreate_requested = false;
        self.last_presented = None;
        tracing::info!(
            "swapchain recreated: {}x{} ({}x{} presented), {:?}, {} images",
            extent.swap_image.width,
            extent.swap_image.height,
            extent.presented().width,
            extent.presented().height,
            present_mode,
            image_count
        );
        Ok(())
    }

    /// Follow a new swap image count. The device must be idle.
    #[allow(clippy::cast_possible_truncation)]
    fn set_frame_slots(&mut self, frame_slots: usize) -> Result<()> {
        tracing::debug!("frame slots: {} -> {frame_slots}", self.frames.image_count());
        self.textures.set_frame_slots(&mut self.memory, frame_slots);
        self.streams.set_frame_slots(&mut self.memory, frame_slots);
        self.recorders.set_frame_slots(frame_slots)?;
        self.memory.set_frame_slots(frame_slots);

        let device = self.context.device();
        // SAFETY: the device is idle, no buffer is pending.
        unsafe {
            self.command_pool.free(device, &self.draw_buffers);
            self.command_pool.free(device, &self.memory_buffers);
            self.draw_buffers = Vec::new();
            self.memory_buffers = Vec::new();
            self.draw_buffers =
                self.command_pool
                    .allocate(device, vk::CommandBufferLevel::PRIMARY, frame_slots as u32)?;
            self.memory_buffers =
                self.command_pool
                    .allocate(device, vk::CommandBufferLevel::PRIMARY, frame_slots as u32)?;
        }
        self.memory_begun = vec![false; frame_slots];
        self.image_index = self.image_index.min(frame_slots.saturating_sub(1));
        Ok(())
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        if let Err(err) = self.context.wait_idle() {
            tracing::warn!("waiting for the device during shutdown failed: {err}");
        }
        self.workers.take();
        if let Some(recorders) = Arc::get_mut(&mut self.recorders) {
            recorders.destroy();
        }

        let device = self.context.device();
        if let Some(mut pipelines) = self.pipelines.take() {
            pipelines.destroy();
        }
        // SAFETY: the device is idle and the workers have exited.
        unsafe {
            if let Some(mut targets) = self.targets.take() {
                targets.destroy(device, &mut self.context.allocator().lock());
            }
            if let (Some(swapchain), Ok(loader)) = (self.swapchain.take(), self.context.swapchain_loader()) {
                swapchain.destroy(device, loader);
            }
        }

        self.textures.destroy_all(&mut self.memory);
        self.buffers.destroy(&mut self.memory);
        self.streams.destroy(&mut self.memory);

        // SAFETY: see above.
        unsafe {
            device.destroy_descriptor_set_layout(self.layouts.uniform, None);
            self.command_pool.free(device, &self.draw_buffers);
            self.command_pool.free(device, &self.memory_buffers);
            self.command_pool.destroy(device);
            for semaphores in &self.semaphores {
                semaphores.destroy(device);
            }
        }
        self.semaphores.clear();
        self.frames.reset(Vec::new());
        self.memory.destroy();
        self.usage.reset();
        self.errors.reset();
        tracing::info!("vulkan backend shut down");
    }
}

fn create_fences(device: &Arc<ash::Device>, count: usize) -> Result<Vec<DeviceFence>> {
    (0..count)
        // SAFETY: the device is valid; fences are dropped before it.
        .map(|_| unsafe { DeviceFence::new(Arc::clone(device)) }.map_err(BackendError::from))
        .collect()
}

fn create_semaphores(device: &ash::Device, count: usize) -> Result<Vec<FrameSemaphores>> {
    let mut semaphores = Vec::with_capacity(count);
    for _ in 0..count {
        // SAFETY: the device is valid; the semaphores are destroyed by the backend.
        match unsafe { FrameSemaphores::new(device) } {
            Ok(created) => semaphores.push(created),
            Err(err) => {
                for created in &semaphores {
                    // SAFETY: never used.
                    unsafe { created.destroy(device) };
                }
                return Err(err.into());
            }
        }
    }
    Ok(semaphores)
}

/// Error category reported for a failed command.
pub fn error_kind_for(kind: CommandKind, err: &BackendError) -> ErrorKind {
    let out_of_memory = err.is_out_of_memory();
    match kind {
        CommandKind::TextureCreate | CommandKind::TextTexturesCreate | CommandKind::TextTextureUpdate
            if out_of_memory =>
        {
            ErrorKind::OutOfMemoryImage
        }
        CommandKind::CreateBufferObject
        | CommandKind::RecreateBufferObject
        | CommandKind::UpdateBufferObject
        | CommandKind::CopyBufferObject
        | CommandKind::IndicesRequiredNumNotify
            if out_of_memory =>
        {
            ErrorKind::OutOfMemoryBuffer
        }
        _ if out_of_memory => ErrorKind::OutOfMemoryStaging,
        CommandKind::Swap | CommandKind::TrySwapAndReadPixel | CommandKind::TrySwapAndScreenshot => {
            ErrorKind::SwapFailed
        }
        _ if is_render_command(kind) => ErrorKind::RenderRecording,
        _ => ErrorKind::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_memory_is_reported_by_resource_type() {
        let oom = BackendError::OutOfMemory {
            reason: "device memory".into(),
            usage: String::new(),
        };
        assert_eq!(error_kind_for(CommandKind::TextureCreate, &oom), ErrorKind::OutOfMemoryImage);
        assert_eq!(
            error_kind_for(CommandKind::IndicesRequiredNumNotify, &oom),
            ErrorKind::OutOfMemoryBuffer
        );
        assert_eq!(error_kind_for(CommandKind::Render, &oom), ErrorKind::OutOfMemoryStaging);
    }

    #[test]
    fn other_failures_follow_the_command_group() {
        let invalid = BackendError::InvalidHandle {
            kind: "texture",
            index: 3,
        };
        assert_eq!(error_kind_for(CommandKind::RenderText, &invalid), ErrorKind::RenderRecording);
        assert_eq!(error_kind_for(CommandKind::Swap, &invalid), ErrorKind::SwapFailed);
        assert_eq!(error_kind_for(CommandKind::TextureCreate, &invalid), ErrorKind::Unknown);
    }
}
