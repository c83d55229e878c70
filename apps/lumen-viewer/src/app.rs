//! Viewer application: a small ray traced scene.

use std::path::PathBuf;

use glam::{Quat, Vec3};
use tracing::info;
use winit::event::ElementState;
use winit::keyboard::{KeyCode, PhysicalKey};

use lumen_app::{
    load_shaders, AppContext, Camera, FrameContext, LumenApp, SceneRenderer, WindowEvent,
};
use lumen_scene::{
    primitives, Entity, MaterialLibrary, MaterialSource, MeshRenderer, Scene, Transform,
    VulkanSceneBackend,
};

/// Camera orbit speed in radians per second.
const ORBIT_SPEED: f32 = 0.3;
const ORBIT_RADIUS: f32 = 6.0;
const ORBIT_HEIGHT: f32 = 3.0;

/// Cube spin in radians per second.
const SPIN_SPEED: f32 = 0.8;

/// Options the app reads itself (from CLI).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ViewerOptions {
    pub ground_texture: Option<PathBuf>,
}

impl ViewerOptions {
    pub fn from_args() -> Self {
        Self::parse(std::env::args().skip(1))
    }

    fn parse(args: impl IntoIterator<Item = String>) -> Self {
        let mut options = Self::default();
        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            if arg == "--texture" {
                options.ground_texture = args.next().map(PathBuf::from);
            }
        }
        options
    }
}

pub struct Viewer {
    scene: Scene,
    materials: MaterialLibrary,
    renderer: SceneRenderer,
    camera: Camera,
    cube: Entity,
    orbit_angle: f32,
    spin_angle: f32,
    paused: bool,
}

impl LumenApp for Viewer {
    fn init(ctx: &mut AppContext) -> anyhow::Result<Self> {
        let options = ViewerOptions::from_args();

        let shaders = load_shaders(&ctx.config.shader_dir)?;
        let mut renderer = SceneRenderer::new(ctx, &shaders)?;

        let mut materials = MaterialLibrary::new();
        let (ground, red) = {
            let mut uploader = renderer.texture_uploader(ctx);
            let ground = materials.try_to_load_material(
                &MaterialSource {
                    base_color_texture: options.ground_texture.clone(),
                    ..MaterialSource::colored("ground", [0.8, 0.8, 0.8, 1.0])
                },
                &mut uploader,
            );
            let red = materials.try_to_load_material(
                &MaterialSource {
                    metallic_factor: 0.2,
                    roughness_factor: 0.4,
                    ..MaterialSource::colored("red", [0.9, 0.15, 0.1, 1.0])
                },
                &mut uploader,
            );
            (ground, red)
        };
        info!(
            materials = materials.len(),
            textures = renderer.textures().len(),
            "Materials loaded"
        );

        let mut scene = Scene::new();
        let plane = scene.add_mesh(primitives::plane(10.0))?;
        let cube_mesh = scene.add_mesh(primitives::cube(1.0))?;

        scene.spawn((
            Transform::default(),
            MeshRenderer {
                mesh: plane,
                material: ground,
            },
        ));
        let cube = scene.spawn((
            Transform::from_position(Vec3::new(0.0, 1.0, 0.0)),
            MeshRenderer {
                mesh: cube_mesh,
                material: red,
            },
        ));

        let mut camera = Camera::looking_at(
            Vec3::new(ORBIT_RADIUS, ORBIT_HEIGHT, 0.0),
            Vec3::ZERO,
            ctx.aspect_ratio(),
        );
        camera.look_at(Vec3::new(0.0, 0.5, 0.0));

        Ok(Self {
            scene,
            materials,
            renderer,
            camera,
            cube,
            orbit_angle: 0.0,
            spin_angle: 0.0,
            paused: false,
        })
    }

    fn update(&mut self, ctx: &mut AppContext, dt: f32) -> anyhow::Result<()> {
        if !self.paused {
            self.orbit_angle += ORBIT_SPEED * dt;
            self.spin_angle += SPIN_SPEED * dt;
        }

        self.camera.position = Vec3::new(
            ORBIT_RADIUS * self.orbit_angle.cos(),
            ORBIT_HEIGHT,
            ORBIT_RADIUS * self.orbit_angle.sin(),
        );
        self.camera.look_at(Vec3::new(0.0, 0.5, 0.0));

        let mut backend = VulkanSceneBackend::new(&ctx.gpu, &ctx.rt, &mut ctx.deletion);
        let created = self.scene.execute_entity_create_queue(&mut backend)?;
        if created > 0 {
            info!(created, "Entities uploaded");
        }

        if !self.paused {
            self.scene.set_transform(
                self.cube,
                Transform::from_position(Vec3::new(0.0, 1.0, 0.0))
                    .with_rotation(Quat::from_rotation_y(self.spin_angle)),
            )?;
        }
        self.scene.update_tlas(&mut backend)?;

        self.materials.sync_gpu_buffer(&ctx.gpu, &mut ctx.deletion)?;
        Ok(())
    }

    fn render(&mut self, ctx: &mut AppContext, frame: &mut FrameContext) -> anyhow::Result<()> {
        self.renderer
            .render_scene(ctx, frame, &self.scene, &self.materials, &self.camera)
    }

    fn on_resize(&mut self, ctx: &mut AppContext, width: u32, height: u32) -> anyhow::Result<()> {
        self.camera.set_aspect(width as f32 / height.max(1) as f32);
        self.renderer.resize(ctx)
    }

    fn on_event(&mut self, event: &WindowEvent) -> bool {
        if let WindowEvent::KeyboardInput { event, .. } = event {
            if event.state == ElementState::Pressed
                && !event.repeat
                && event.physical_key == PhysicalKey::Code(KeyCode::Space)
            {
                self.paused = !self.paused;
                info!(paused = self.paused, "Animation toggled");
                return true;
            }
        }
        false
    }

    fn cleanup(&mut self, ctx: &mut AppContext) {
        self.renderer.destroy(ctx);
        self.materials.destroy(&ctx.gpu, &mut ctx.deletion);
        let mut backend = VulkanSceneBackend::new(&ctx.gpu, &ctx.rt, &mut ctx.deletion);
        self.scene.destroy(&mut backend);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn texture_flag_is_picked_up() {
        let args = ["--vsync", "--texture", "ground.png"].map(String::from);
        let options = ViewerOptions::parse(args);
        assert_eq!(options.ground_texture, Some(PathBuf::from("ground.png")));
        assert_eq!(ViewerOptions::parse(Vec::new()), ViewerOptions::default());
    }
}
