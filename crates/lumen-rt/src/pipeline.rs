//! Ray tracing pipeline creation.

use crate::context::RayTracingContext;
use ash::vk;
use lumen_gpu::pipeline::{create_pipeline_layout, create_shader_module};
use lumen_gpu::{GpuError, Result};

/// SPIR-V for every stage of a triangle-only ray tracing pipeline.
pub struct RayTracingShaders {
    pub raygen: Vec<u32>,
    pub miss: Vec<Vec<u32>>,
    pub closest_hit: Vec<Vec<u32>>,
}

/// Shader groups in SBT order.
///
/// Stage indices follow the same order: raygen at 0, then miss shaders, then
/// closest-hit shaders.
pub fn shader_groups(
    miss_count: u32,
    hit_count: u32,
) -> Vec<vk::RayTracingShaderGroupCreateInfoKHR<'static>> {
    let general = |stage: u32| {
        vk::RayTracingShaderGroupCreateInfoKHR::default()
            .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
            .general_shader(stage)
            .closest_hit_shader(vk::SHADER_UNUSED_KHR)
            .any_hit_shader(vk::SHADER_UNUSED_KHR)
            .intersection_shader(vk::SHADER_UNUSED_KHR)
    };

    let mut groups = Vec::with_capacity((1 + miss_count + hit_count) as usize);
    groups.push(general(0));
    groups.extend((1..=miss_count).map(general));
    groups.extend((0..hit_count).map(|i| {
        vk::RayTracingShaderGroupCreateInfoKHR::default()
            .ty(vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP)
            .general_shader(vk::SHADER_UNUSED_KHR)
            .closest_hit_shader(1 + miss_count + i)
            .any_hit_shader(vk::SHADER_UNUSED_KHR)
            .intersection_shader(vk::SHADER_UNUSED_KHR)
    }));
    groups
}

pub struct RayTracingPipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub miss_count: u32,
    pub hit_count: u32,
}

impl RayTracingPipeline {
    /// Create the pipeline and its layout.
    ///
    /// Recursion depth is clamped to the device limit.
    ///
    /// # Safety
    /// The device must be valid and the set layouts must outlive the pipeline.
    pub unsafe fn new(
        device: &ash::Device,
        rt: &RayTracingContext,
        shaders: &RayTracingShaders,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constant_ranges: &[vk::PushConstantRange],
        max_recursion_depth: u32,
    ) -> Result<Self> {
        if shaders.miss.is_empty() || shaders.closest_hit.is_empty() {
            return Err(GpuError::invalid_spec(
                "ray tracing pipeline",
                "at least one miss and one closest-hit shader",
                format!("{} miss, {} hit", shaders.miss.len(), shaders.closest_hit.len()),
            ));
        }
        let miss_count = shaders.miss.len() as u32;
        let hit_count = shaders.closest_hit.len() as u32;

        let stages_code = std::iter::once((vk::ShaderStageFlags::RAYGEN_KHR, &shaders.raygen))
            .chain(shaders.miss.iter().map(|c| (vk::ShaderStageFlags::MISS_KHR, c)))
            .chain(
                shaders
                    .closest_hit
                    .iter()
                    .map(|c| (vk::ShaderStageFlags::CLOSEST_HIT_KHR, c)),
            );

        let mut modules = Vec::new();
        let mut stages = Vec::new();
        for (stage, code) in stages_code {
            let module = match create_shader_module(device, code) {
                Ok(module) => module,
                Err(e) => {
                    destroy_modules(device, &modules);
                    return Err(e);
                }
            };
            modules.push(module);
            stages.push(
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(stage)
                    .module(module)
                    .name(c"main"),
            );
        }

        let layout = match create_pipeline_layout(device, set_layouts, push_constant_ranges) {
            Ok(layout) => layout,
            Err(e) => {
                destroy_modules(device, &modules);
                return Err(e);
            }
        };

        let recursion = max_recursion_depth
            .clamp(1, rt.capabilities.max_ray_recursion_depth.max(1));
        let groups = shader_groups(miss_count, hit_count);
        let info = vk::RayTracingPipelineCreateInfoKHR::default()
            .stages(&stages)
            .groups(&groups)
            .max_pipeline_ray_recursion_depth(recursion)
            .layout(layout);

        let result = rt.rt_loader.create_ray_tracing_pipelines(
            vk::DeferredOperationKHR::null(),
            vk::PipelineCache::null(),
            std::slice::from_ref(&info),
            None,
        );
        destroy_modules(device, &modules);

        let pipeline = match result {
            Ok(pipelines) => pipelines[0],
            Err((_, e)) => {
                device.destroy_pipeline_layout(layout, None);
                return Err(GpuError::PipelineCreation(format!("ray tracing pipeline: {e}")));
            }
        };

        tracing::debug!(miss_count, hit_count, recursion, "created ray tracing pipeline");
        Ok(Self {
            pipeline,
            layout,
            miss_count,
            hit_count,
        })
    }

    /// # Safety
    /// The pipeline must not be in use by the GPU.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_pipeline(self.pipeline, None);
        device.destroy_pipeline_layout(self.layout, None);
    }
}

unsafe fn destroy_modules(device: &ash::Device, modules: &[vk::ShaderModule]) {
    for &module in modules {
        device.destroy_shader_module(module, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn groups_follow_stage_order() {
        let groups = shader_groups(2, 1);
        assert_eq!(groups.len(), 4);

        assert_eq!(groups[0].ty, vk::RayTracingShaderGroupTypeKHR::GENERAL);
        assert_eq!(groups[0].general_shader, 0);
        assert_eq!(groups[1].general_shader, 1);
        assert_eq!(groups[2].general_shader, 2);

        assert_eq!(groups[3].ty, vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP);
        assert_eq!(groups[3].general_shader, vk::SHADER_UNUSED_KHR);
        assert_eq!(groups[3].closest_hit_shader, 3);
        assert_eq!(groups[3].intersection_shader, vk::SHADER_UNUSED_KHR);
    }
}
