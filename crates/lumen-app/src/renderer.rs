//! Ray traced scene renderer.
//!
//! Traces the scene TLAS into a storage image and blits the result onto the
//! acquired swapchain image. Descriptor set 0 is duplicated per frame-in-flight
//! slot so rewriting it never races a frame the GPU is still executing.

use std::path::Path;

use anyhow::Context as _;
use ash::vk;
use lumen_core::constants::MAX_BINDLESS_TEXTURES;
use lumen_gpu::{
    pipeline::load_spirv, record_image_barrier, write_acceleration_structure,
    write_storage_buffer, write_storage_image, BindlessTextureTable, DescriptorPool,
    DescriptorSetLayoutBuilder, GpuImage, ImageBarrier, ImageDesc,
};
use lumen_rt::{RayTracingPipeline, RayTracingShaders, ShaderBindingTable};
use lumen_scene::{BindlessTextures, GpuTextureUploader, MaterialLibrary, Scene};

use crate::camera::{Camera, CameraPushConstants};
use crate::context::AppContext;
use crate::frame::FrameContext;

const TLAS_BINDING: u32 = 0;
const OUTPUT_BINDING: u32 = 1;
const MATERIALS_BINDING: u32 = 2;
const TEXTURES_BINDING: u32 = 0;

const OUTPUT_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;
const CLEAR_COLOR: [f32; 4] = [0.02, 0.02, 0.03, 1.0];

/// File names of the precompiled shaders inside the shader directory.
pub const RAYGEN_SHADER: &str = "raygen.rgen.spv";
pub const MISS_SHADER: &str = "miss.rmiss.spv";
pub const CLOSEST_HIT_SHADER: &str = "closest_hit.rchit.spv";

/// Load the three ray tracing stages from `dir`.
pub fn load_shaders(dir: &Path) -> anyhow::Result<RayTracingShaders> {
    let load = |name: &str| {
        let path = dir.join(name);
        load_spirv(&path).with_context(|| format!("loading {}", path.display()))
    };
    Ok(RayTracingShaders {
        raygen: load(RAYGEN_SHADER)?,
        miss: vec![load(MISS_SHADER)?],
        closest_hit: vec![load(CLOSEST_HIT_SHADER)?],
    })
}

/// What a slot's scene set currently points at.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct SlotBinding {
    tlas_generation: Option<u64>,
    output_generation: Option<u64>,
    materials: Option<vk::Buffer>,
}

impl SlotBinding {
    fn is_current(&self, tlas_generation: u64, output_generation: u64, materials: vk::Buffer) -> bool {
        self.tlas_generation == Some(tlas_generation)
            && self.output_generation == Some(output_generation)
            && self.materials == Some(materials)
    }
}

struct OutputImage {
    image: GpuImage,
    view: vk::ImageView,
    generation: u64,
}

pub struct SceneRenderer {
    scene_layout: vk::DescriptorSetLayout,
    texture_layout: vk::DescriptorSetLayout,
    pool: DescriptorPool,
    scene_sets: Vec<vk::DescriptorSet>,
    bindings: Vec<SlotBinding>,
    textures: BindlessTextures,
    output: Option<OutputImage>,
    next_output_generation: u64,
    pipeline: RayTracingPipeline,
    sbt: Option<ShaderBindingTable>,
}

impl SceneRenderer {
    pub fn new(ctx: &mut AppContext, shaders: &RayTracingShaders) -> anyhow::Result<Self> {
        let device = ctx.gpu.device();
        let rt_stages = vk::ShaderStageFlags::RAYGEN_KHR | vk::ShaderStageFlags::CLOSEST_HIT_KHR;

        let scene_layout = unsafe {
            DescriptorSetLayoutBuilder::new()
                .acceleration_structure(TLAS_BINDING, rt_stages)
                .storage_image(OUTPUT_BINDING, vk::ShaderStageFlags::RAYGEN_KHR)
                .storage_buffer(MATERIALS_BINDING, vk::ShaderStageFlags::CLOSEST_HIT_KHR)
                .build(device)?
        };
        let texture_layout = unsafe {
            DescriptorSetLayoutBuilder::new()
                .bindless_textures(
                    TEXTURES_BINDING,
                    MAX_BINDLESS_TEXTURES,
                    vk::ShaderStageFlags::CLOSEST_HIT_KHR,
                )
                .build(device)?
        };

        let pool = unsafe { DescriptorPool::shared(device)? };
        let slot_layouts = vec![scene_layout; ctx.frames_in_flight()];
        let scene_sets = unsafe { pool.allocate(device, &slot_layouts)? };
        let texture_set = unsafe { pool.allocate_one(device, texture_layout)? };

        let textures = BindlessTextures::new(
            &ctx.gpu,
            BindlessTextureTable::new(texture_set, TEXTURES_BINDING, MAX_BINDLESS_TEXTURES),
        )?;

        let push_range = vk::PushConstantRange::default()
            .stage_flags(vk::ShaderStageFlags::RAYGEN_KHR)
            .offset(0)
            .size(std::mem::size_of::<CameraPushConstants>() as u32);
        let pipeline = unsafe {
            RayTracingPipeline::new(
                device,
                &ctx.rt,
                shaders,
                &[scene_layout, texture_layout],
                &[push_range],
                1,
            )?
        };
        let sbt = ShaderBindingTable::new(
            &ctx.gpu,
            &ctx.rt,
            pipeline.pipeline,
            pipeline.miss_count,
            pipeline.hit_count,
        )?;

        let mut renderer = Self {
            scene_layout,
            texture_layout,
            pool,
            bindings: vec![SlotBinding::default(); scene_sets.len()],
            scene_sets,
            textures,
            output: None,
            next_output_generation: 0,
            pipeline,
            sbt: Some(sbt),
        };
        renderer.recreate_output(ctx)?;

        tracing::info!(
            frames_in_flight = renderer.scene_sets.len(),
            "Scene renderer initialized"
        );
        Ok(renderer)
    }

    pub fn textures(&self) -> &BindlessTextures {
        &self.textures
    }

    /// Uploader for [`MaterialLibrary::try_to_load_material`].
    pub fn texture_uploader<'a>(&'a mut self, ctx: &'a AppContext) -> GpuTextureUploader<'a> {
        GpuTextureUploader::new(&ctx.gpu, &mut self.textures)
    }

    /// Recreate the output image for the current swapchain extent.
    pub fn resize(&mut self, ctx: &mut AppContext) -> anyhow::Result<()> {
        self.recreate_output(ctx)
    }

    fn recreate_output(&mut self, ctx: &mut AppContext) -> anyhow::Result<()> {
        let extent = ctx.extent();
        if let Some(output) = &self.output {
            if output.image.extent() == extent {
                return Ok(());
            }
        }

        let image = ctx.gpu.create_image(&ImageDesc::new(
            "ray_tracing_output",
            extent,
            OUTPUT_FORMAT,
            vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::TRANSFER_SRC,
        ))?;
        let view = match unsafe { image.create_view(ctx.gpu.device()) } {
            Ok(view) => view,
            Err(e) => {
                ctx.gpu.allocator().lock().destroy_image(image)?;
                return Err(e.into());
            }
        };

        let generation = self.next_output_generation;
        self.next_output_generation += 1;
        if let Some(old) = self.output.replace(OutputImage {
            image,
            view,
            generation,
        }) {
            ctx.deletion.retire_image_view(ctx.gpu.device_arc(), old.view);
            ctx.deletion.retire_image(ctx.gpu.allocator(), old.image);
        }

        tracing::debug!(
            width = extent.width,
            height = extent.height,
            generation,
            "created ray tracing output image"
        );
        Ok(())
    }

    /// Record the frame: trace, then blit onto the swapchain image and
    /// leave it ready for presentation.
    ///
    /// Before the first TLAS and material buffer exist the swapchain image is
    /// cleared instead.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn render_scene(
        &mut self,
        ctx: &AppContext,
        frame: &FrameContext,
        scene: &Scene,
        materials: &MaterialLibrary,
        camera: &Camera,
    ) -> anyhow::Result<()> {
        let device = ctx.gpu.device();
        let cmd = frame.command_buffer;

        let (Some(tlas), Some(material_buffer), Some(output), Some(sbt)) = (
            scene.tlas(),
            materials.gpu_buffer(),
            self.output.as_mut(),
            self.sbt.as_ref(),
        ) else {
            unsafe { clear_swapchain_image(device, cmd, frame.swapchain_image) };
            return Ok(());
        };

        let slot = frame.frame_index;
        let set = *self
            .scene_sets
            .get(slot)
            .with_context(|| format!("no descriptor set for frame slot {slot}"))?;
        let binding = &mut self.bindings[slot];
        let tlas_generation = scene.tlas_generation();
        if !binding.is_current(tlas_generation, output.generation, material_buffer.handle()) {
            // The slot's fence was waited in begin_frame, so its set is idle.
            unsafe {
                write_acceleration_structure(device, set, TLAS_BINDING, tlas.handle);
                write_storage_image(device, set, OUTPUT_BINDING, output.view);
                write_storage_buffer(
                    device,
                    set,
                    MATERIALS_BINDING,
                    material_buffer.handle(),
                    material_buffer.size(),
                );
            }
            *binding = SlotBinding {
                tlas_generation: Some(tlas_generation),
                output_generation: Some(output.generation),
                materials: Some(material_buffer.handle()),
            };
            tracing::trace!(slot, tlas_generation, "rewrote scene descriptor set");
        }

        let extent = output.image.extent();
        let push = camera.push_constants();
        unsafe {
            output
                .image
                .transition(device, cmd, ImageBarrier::RAY_TRACING_WRITE);

            device.cmd_bind_pipeline(
                cmd,
                vk::PipelineBindPoint::RAY_TRACING_KHR,
                self.pipeline.pipeline,
            );
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::RAY_TRACING_KHR,
                self.pipeline.layout,
                0,
                &[set, self.textures.table().set()],
                &[],
            );
            device.cmd_push_constants(
                cmd,
                self.pipeline.layout,
                vk::ShaderStageFlags::RAYGEN_KHR,
                0,
                bytemuck::bytes_of(&push),
            );
            sbt.cmd_trace_rays(&ctx.rt, cmd, extent.width, extent.height);

            output
                .image
                .transition(device, cmd, ImageBarrier::TRANSFER_SRC_AFTER_RAY_TRACING);
            record_image_barrier(
                device,
                cmd,
                frame.swapchain_image,
                vk::ImageLayout::UNDEFINED,
                ImageBarrier::ACQUIRED_TO_TRANSFER_DST,
            );

            let region = blit_region(extent, frame.extent);
            device.cmd_blit_image(
                cmd,
                output.image.handle(),
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                frame.swapchain_image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
                vk::Filter::NEAREST,
            );

            record_image_barrier(
                device,
                cmd,
                frame.swapchain_image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                ImageBarrier::PRESENT_AFTER_TRANSFER,
            );
        }
        Ok(())
    }

    /// Retire GPU objects and destroy the pipeline and descriptor state.
    ///
    /// Call with the device idle, before the deletion queue is flushed.
    pub fn destroy(&mut self, ctx: &mut AppContext) {
        if let Some(sbt) = self.sbt.take() {
            sbt.retire(&mut ctx.deletion, ctx.gpu.allocator());
        }
        if let Some(output) = self.output.take() {
            ctx.deletion.retire_image_view(ctx.gpu.device_arc(), output.view);
            ctx.deletion.retire_image(ctx.gpu.allocator(), output.image);
        }
        self.textures.destroy(&ctx.gpu, &mut ctx.deletion);

        let device = ctx.gpu.device();
        unsafe {
            self.pipeline.destroy(device);
            self.pool.destroy(device);
            device.destroy_descriptor_set_layout(self.scene_layout, None);
            device.destroy_descriptor_set_layout(self.texture_layout, None);
        }
        self.scene_sets.clear();
        self.bindings.clear();
    }
}

fn blit_region(src: vk::Extent2D, dst: vk::Extent2D) -> vk::ImageBlit {
    let subresource = vk::ImageSubresourceLayers::default()
        .aspect_mask(vk::ImageAspectFlags::COLOR)
        .mip_level(0)
        .base_array_layer(0)
        .layer_count(1);
    let corner = |extent: vk::Extent2D| vk::Offset3D {
        x: extent.width as i32,
        y: extent.height as i32,
        z: 1,
    };
    vk::ImageBlit::default()
        .src_subresource(subresource)
        .src_offsets([vk::Offset3D::default(), corner(src)])
        .dst_subresource(subresource)
        .dst_offsets([vk::Offset3D::default(), corner(dst)])
}

/// # Safety
/// The command buffer must be recording and the image freshly acquired.
unsafe fn clear_swapchain_image(device: &ash::Device, cmd: vk::CommandBuffer, image: vk::Image) {
    record_image_barrier(
        device,
        cmd,
        image,
        vk::ImageLayout::UNDEFINED,
        ImageBarrier::ACQUIRED_TO_TRANSFER_DST,
    );
    let color = vk::ClearColorValue {
        float32: CLEAR_COLOR,
    };
    let range = vk::ImageSubresourceRange::default()
        .aspect_mask(vk::ImageAspectFlags::COLOR)
        .level_count(1)
        .layer_count(1);
    device.cmd_clear_color_image(
        cmd,
        image,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        &color,
        &[range],
    );
    record_image_barrier(
        device,
        cmd,
        image,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        ImageBarrier::PRESENT_AFTER_TRANSFER,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_binding_goes_stale_on_any_change() {
        let buffer = vk::Buffer::null();
        let bound = SlotBinding {
            tlas_generation: Some(3),
            output_generation: Some(1),
            materials: Some(buffer),
        };
        assert!(bound.is_current(3, 1, buffer));
        assert!(!bound.is_current(4, 1, buffer));
        assert!(!bound.is_current(3, 2, buffer));
        assert!(!SlotBinding::default().is_current(3, 1, buffer));
    }

    #[test]
    fn blit_covers_both_extents() {
        let region = blit_region(
            vk::Extent2D { width: 640, height: 360 },
            vk::Extent2D { width: 1280, height: 720 },
        );
        assert_eq!(region.src_offsets[1].x, 640);
        assert_eq!(region.src_offsets[1].y, 360);
        assert_eq!(region.dst_offsets[1].x, 1280);
        assert_eq!(region.dst_offsets[1].z, 1);
    }

    #[test]
    fn missing_shader_dir_names_the_file() {
        let dir = std::env::temp_dir().join("lumen_no_such_shader_dir");
        let err = load_shaders(&dir).err().map(|e| format!("{e:#}"));
        assert!(err.is_some_and(|e| e.contains(RAYGEN_SHADER)));
    }
}
