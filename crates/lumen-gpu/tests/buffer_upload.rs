//! Buffer upload and readback against a real device.
//!
//! Run with `cargo test -p lumen-gpu -- --ignored` on a machine with Vulkan 1.3.

use ash::vk;
use lumen_gpu::{
    create_buffer_with_data, BufferDesc, DeletionQueue, GpuContext, GpuContextBuilder,
    MemoryLocation,
};

fn context() -> GpuContext {
    GpuContextBuilder::new()
        .app_name("lumen-gpu-tests")
        .validation(false)
        .ray_tracing(false)
        .build()
        .expect("failed to create GPU context")
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

#[test]
#[ignore = "requires a Vulkan device"]
fn mapped_upload_reads_back_identical_bytes() {
    let ctx = context();
    let data = pattern(1024);

    let buffer = create_buffer_with_data(
        &ctx,
        &BufferDesc::new(
            "mapped",
            data.len() as u64,
            vk::BufferUsageFlags::STORAGE_BUFFER,
            MemoryLocation::CpuToGpu,
        ),
        &data,
    )
    .unwrap();

    assert!(buffer.is_mapped());
    assert_eq!(buffer.read_bytes(0, data.len() as u64).unwrap(), data);

    ctx.allocator().lock().destroy_buffer(buffer).unwrap();
}

#[test]
#[ignore = "requires a Vulkan device"]
fn staged_upload_reaches_device_local_buffer() {
    let ctx = context();
    let data = pattern(4096);
    let size = data.len() as u64;

    let device_local = create_buffer_with_data(
        &ctx,
        &BufferDesc::new(
            "device_local",
            size,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::GpuOnly,
        ),
        &data,
    )
    .unwrap();
    assert!(!device_local.is_mapped());

    let readback = ctx
        .create_buffer(&BufferDesc::new(
            "readback",
            size,
            vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuToCpu,
        ))
        .unwrap();

    ctx.immediate_submit(|cmd| unsafe {
        let region = vk::BufferCopy::default().size(size);
        ctx.device()
            .cmd_copy_buffer(cmd, device_local.handle(), readback.handle(), &[region]);
    })
    .unwrap();

    assert_eq!(readback.read_bytes(0, size).unwrap(), data);

    let mut deletion = DeletionQueue::for_frames_in_flight(2);
    deletion.retire_buffer(ctx.allocator(), device_local);
    deletion.retire_buffer(ctx.allocator(), readback);
    ctx.wait_idle().unwrap();
    assert_eq!(deletion.execute(true), 2);
}

#[test]
#[ignore = "requires a Vulkan device"]
fn invalid_desc_fails_before_allocation() {
    let ctx = context();
    let result = ctx.create_buffer(&BufferDesc::new(
        "bad",
        0,
        vk::BufferUsageFlags::STORAGE_BUFFER,
        MemoryLocation::GpuOnly,
    ));
    assert!(result.is_err());
}
