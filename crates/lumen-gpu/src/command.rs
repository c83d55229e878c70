//! Command buffer management and blocking one-shot submission.

use crate::error::{GpuError, Result};
use crate::sync::{create_fence, reset_fence, wait_for_fence};
use ash::vk;

/// Command pool for allocating command buffers.
pub struct CommandPool {
    pool: vk::CommandPool,
    queue_family: u32,
}

impl CommandPool {
    /// Create a new command pool.
    ///
    /// # Safety
    /// The device must be valid and the queue family must exist.
    pub unsafe fn new(
        device: &ash::Device,
        queue_family: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> Result<Self> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(flags);

        let pool = device.create_command_pool(&create_info, None)?;

        Ok(Self { pool, queue_family })
    }

    pub fn handle(&self) -> vk::CommandPool {
        self.pool
    }

    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    /// Allocate primary command buffers.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn allocate(&self, device: &ash::Device, count: u32) -> Result<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);

        Ok(device.allocate_command_buffers(&alloc_info)?)
    }

    /// Destroy the command pool.
    ///
    /// # Safety
    /// The device must be valid and the pool must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_command_pool(self.pool, None);
    }
}

/// Begin recording a command buffer.
///
/// # Safety
/// The device and command buffer must be valid.
pub unsafe fn begin_command_buffer(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    flags: vk::CommandBufferUsageFlags,
) -> Result<()> {
    let begin_info = vk::CommandBufferBeginInfo::default().flags(flags);
    device.begin_command_buffer(cmd, &begin_info)?;
    Ok(())
}

/// End recording a command buffer.
///
/// # Safety
/// The device and command buffer must be valid.
pub unsafe fn end_command_buffer(device: &ash::Device, cmd: vk::CommandBuffer) -> Result<()> {
    device.end_command_buffer(cmd)?;
    Ok(())
}

/// Reusable command buffer and fence for blocking submissions
/// (uploads, acceleration structure builds).
pub struct ImmediateSubmitter {
    pool: CommandPool,
    command_buffer: vk::CommandBuffer,
    fence: vk::Fence,
    queue: vk::Queue,
    timeout_ns: u64,
}

impl ImmediateSubmitter {
    /// # Safety
    /// The device must be valid and `queue` must belong to `queue_family`.
    pub unsafe fn new(
        device: &ash::Device,
        queue_family: u32,
        queue: vk::Queue,
        timeout_ns: u64,
    ) -> Result<Self> {
        let pool = CommandPool::new(
            device,
            queue_family,
            vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER
                | vk::CommandPoolCreateFlags::TRANSIENT,
        )?;
        let command_buffer = pool
            .allocate(device, 1)?
            .into_iter()
            .next()
            .ok_or_else(|| GpuError::Other("command buffer allocation returned nothing".into()))?;
        let fence = create_fence(device, false)?;

        Ok(Self {
            pool,
            command_buffer,
            fence,
            queue,
            timeout_ns,
        })
    }

    /// Record commands with `f`, submit them and block until they complete.
    ///
    /// A failed wait is reported as [`GpuError::DeviceLost`].
    ///
    /// # Safety
    /// The device must be valid and everything `f` records must stay alive
    /// until this returns.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub unsafe fn submit<F>(&self, device: &ash::Device, f: F) -> Result<()>
    where
        F: FnOnce(vk::CommandBuffer),
    {
        let cmd = self.command_buffer;
        device.reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())?;
        begin_command_buffer(device, cmd, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
        f(cmd);
        end_command_buffer(device, cmd)?;

        let cmds = [cmd];
        let submit_info = vk::SubmitInfo::default().command_buffers(&cmds);
        device.queue_submit(self.queue, &[submit_info], self.fence)?;

        wait_for_fence(device, self.fence, self.timeout_ns, "immediate submit")?;
        reset_fence(device, self.fence)
    }

    /// # Safety
    /// The device must be idle.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_fence(self.fence, None);
        self.pool.destroy(device);
    }
}
