//! Viewer application: the demo scene rendered with virtual shadow maps.

use anyhow::anyhow;
use glam::Vec3;
use tracing::{error, info, warn};

use umbra_app::{
    AppContext, Camera, DeviceEvent, DeviceId, FrameContext, KeyCode, UmbraApp, WindowEvent,
};
use umbra_render::vsm::select::{classify_point, MainViewInfo};
use umbra_render::{
    DebugMode, FrameParams, PresentTarget, SceneBuilder, ShadowRenderer, VsmLayout, VsmSettings,
};

use crate::controls::{Controls, FlyCamera};
use crate::scene::{build_demo_scene, ground_hit, spawn_cube, sun_direction, DemoMeshes};

/// Seconds between residency statistics log lines.
const STATS_INTERVAL: f32 = 2.0;

/// LOD bias change per key press.
const LOD_BIAS_STEP: f32 = 0.5;

/// Distance in front of the camera where spawned cubes land.
const SPAWN_DISTANCE: f32 = 10.0;

/// Runtime options from the command line.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewerParams {
    pub settings: VsmSettings,
    pub debug_mode: DebugMode,
    /// Sun azimuth speed in radians per second.
    pub sun_speed: f32,
}

impl Default for ViewerParams {
    fn default() -> Self {
        Self {
            settings: VsmSettings::default(),
            debug_mode: DebugMode::default(),
            sun_speed: 0.05,
        }
    }
}

impl ViewerParams {
    pub fn from_args() -> Self {
        Self::parse(std::env::args().skip(1))
    }

    /// Parse options, ignoring unknown flags and keeping defaults for
    /// malformed values.
    pub fn parse(args: impl IntoIterator<Item = String>) -> Self {
        let mut params = Self::default();
        let args: Vec<String> = args.into_iter().collect();

        let mut i = 0;
        while i < args.len() {
            let value = args.get(i + 1).map(String::as_str);
            let consumed = match (args[i].as_str(), value) {
                ("--first-width", Some(v)) => {
                    match v.parse::<f32>() {
                        Ok(width) if width > 0.0 => params.settings.first_width = width,
                        _ => warn!("Ignoring invalid --first-width {v}"),
                    }
                    true
                }
                ("--lod-bias", Some(v)) => {
                    match v.parse() {
                        Ok(bias) => params.settings.lod_bias = bias,
                        Err(_) => warn!("Ignoring invalid --lod-bias {v}"),
                    }
                    true
                }
                ("--debug", Some(v)) => {
                    match DebugMode::from_name(v) {
                        Some(mode) => params.debug_mode = mode,
                        None => warn!("Unknown debug mode {v}"),
                    }
                    true
                }
                ("--sun-speed", Some(v)) => {
                    match v.parse() {
                        Ok(speed) => params.sun_speed = speed,
                        Err(_) => warn!("Ignoring invalid --sun-speed {v}"),
                    }
                    true
                }
                _ => false,
            };
            i += if consumed { 2 } else { 1 };
        }

        params
    }
}

pub struct Viewer {
    renderer: Option<ShadowRenderer>,
    scene: SceneBuilder,
    meshes: DemoMeshes,
    /// The CPU scene changed and must be uploaded before the next frame.
    scene_dirty: bool,
    spawned: u32,
    camera: Camera,
    fly: FlyCamera,
    controls: Controls,
    params: ViewerParams,
    debug_mode: DebugMode,
    sun_azimuth: f32,
    sun_paused: bool,
    stats_timer: f32,
}

impl UmbraApp for Viewer {
    fn init(ctx: &mut AppContext) -> anyhow::Result<Self> {
        let params = ViewerParams::from_args();
        info!(
            first_width = params.settings.first_width,
            lod_bias = params.settings.lod_bias,
            debug_mode = ?params.debug_mode,
            sun_speed = params.sun_speed,
            "Viewer config"
        );

        let (scene, meshes) = build_demo_scene()?;
        info!(
            instances = scene.instance_count(),
            meshlets = scene.meshlets().len(),
            "Demo scene built"
        );

        let mut renderer = ShadowRenderer::new(
            &ctx.gpu,
            ctx.extent(),
            ctx.swapchain_format(),
            VsmLayout::STANDARD,
            params.settings,
            ctx.frames_in_flight(),
        )?;
        renderer.upload_scene(&ctx.gpu, &scene, ctx.frame_count)?;

        let camera = Camera::looking_at(
            Vec3::new(-18.0, 9.0, 24.0),
            Vec3::new(0.0, 2.0, 0.0),
            ctx.aspect_ratio(),
        );
        let fly = FlyCamera::from_camera(&camera);

        let mut controls = Controls::default();
        controls.set_cursor_locked(&ctx.window, true);

        info!(
            "Controls: WASD move, Esc cursor, F3 debug view, [ ] LOD bias, C spawn cube, \
             P inspect page, T pause sun"
        );

        Ok(Self {
            renderer: Some(renderer),
            scene,
            meshes,
            scene_dirty: false,
            spawned: 0,
            camera,
            fly,
            controls,
            debug_mode: params.debug_mode,
            params,
            sun_azimuth: 0.6,
            sun_paused: false,
            stats_timer: 0.0,
        })
    }

    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    fn update(&mut self, ctx: &AppContext, dt: f32) {
        if self.controls.was_pressed(KeyCode::Escape) {
            let locked = !self.controls.cursor_locked();
            self.controls.set_cursor_locked(&ctx.window, locked);
        }
        if self.controls.was_pressed(KeyCode::F3) {
            self.debug_mode = self.debug_mode.next();
            info!("Debug mode: {:?}", self.debug_mode);
        }
        if self.controls.was_pressed(KeyCode::KeyT) {
            self.sun_paused = !self.sun_paused;
            info!(paused = self.sun_paused, "Sun animation toggled");
        }
        if self.controls.was_pressed(KeyCode::BracketLeft) {
            self.adjust_lod_bias(-LOD_BIAS_STEP);
        }
        if self.controls.was_pressed(KeyCode::BracketRight) {
            self.adjust_lod_bias(LOD_BIAS_STEP);
        }
        if self.controls.was_pressed(KeyCode::KeyC) {
            self.spawn_in_front();
        }
        if self.controls.was_pressed(KeyCode::KeyP) {
            self.inspect_center(ctx.height());
        }

        self.fly.update(&mut self.camera, &self.controls, dt);
        self.controls.end_frame();

        if !self.sun_paused {
            self.sun_azimuth = (self.sun_azimuth + self.params.sun_speed * dt) % std::f32::consts::TAU;
        }

        self.stats_timer += dt;
        if self.stats_timer >= STATS_INTERVAL {
            self.stats_timer = 0.0;
            self.log_stats();
        }
    }

    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    fn render(&mut self, ctx: &AppContext, frame: &mut FrameContext) -> anyhow::Result<()> {
        let sun_direction = sun_direction(self.sun_azimuth);
        let renderer = self
            .renderer
            .as_mut()
            .ok_or_else(|| anyhow!("renderer already destroyed"))?;

        if self.scene_dirty {
            // Scene buffers are shared by every slot
            ctx.wait_for_all_in_flight_frames(u64::MAX)?;
            renderer.upload_scene(&ctx.gpu, &self.scene, frame.frame_number)?;
            self.scene_dirty = false;
        }

        frame.sparse_updates = renderer.begin_frame(&ctx.gpu, frame.slot, frame.frame_number)?;

        let params = FrameParams {
            camera: &self.camera,
            sun_direction,
            debug_mode: self.debug_mode,
        };
        let present = PresentTarget {
            image: frame.swapchain_image,
            view: frame.swapchain_view,
            extent: frame.extent,
        };
        unsafe {
            renderer.record_prepass(
                &ctx.gpu,
                frame.prepass_cmd,
                frame.slot,
                frame.frame_number,
                &params,
            )?;
            renderer.record_main(
                &ctx.gpu,
                frame.command_buffer,
                frame.slot,
                frame.frame_number,
                &params,
                &present,
            )?;
        }
        Ok(())
    }

    fn on_resize(&mut self, ctx: &mut AppContext, width: u32, height: u32) -> anyhow::Result<()> {
        self.camera.set_aspect(width as f32 / height.max(1) as f32);
        if let Some(renderer) = self.renderer.as_mut() {
            renderer.resize(&ctx.gpu, ctx.extent(), ctx.frame_count)?;
            unsafe { renderer.set_swapchain_format(&ctx.gpu, ctx.swapchain_format())? };
        }
        Ok(())
    }

    fn on_event(&mut self, _ctx: &AppContext, event: &WindowEvent) -> bool {
        self.controls.process_window_event(event)
    }

    fn on_device_event(&mut self, _device_id: DeviceId, event: &DeviceEvent) {
        self.controls.process_device_event(event);
    }

    fn cleanup(&mut self, ctx: &mut AppContext) {
        if let Some(renderer) = self.renderer.take() {
            if let Err(e) = renderer.destroy(&ctx.gpu) {
                error!("Failed to destroy renderer: {e}");
            }
        }
    }
}

impl Viewer {
    fn adjust_lod_bias(&mut self, step: f32) {
        self.params.settings.lod_bias += step;
        if let Some(renderer) = self.renderer.as_mut() {
            renderer.vsm_mut().set_settings(self.params.settings);
        }
        info!(lod_bias = self.params.settings.lod_bias, "LOD bias changed");
    }

    fn spawn_in_front(&mut self) {
        let forward = Vec3::new(self.camera.direction.x, 0.0, self.camera.direction.z)
            .try_normalize()
            .unwrap_or(Vec3::NEG_Z);
        let ground = self.camera.position + forward * SPAWN_DISTANCE;
        let size = 1.0 + (self.spawned % 4) as f32 * 0.75;

        match spawn_cube(&mut self.scene, &self.meshes, ground, size, self.spawned) {
            Ok(()) => {
                self.spawned += 1;
                self.scene_dirty = true;
                info!(
                    x = ground.x,
                    z = ground.z,
                    size,
                    instances = self.scene.instance_count(),
                    "Spawned cube"
                );
            }
            Err(e) => warn!("Cannot spawn cube: {e}"),
        }
    }

    /// Log the clipmap level and page the classifier picks for the ground
    /// point under the screen centre.
    fn inspect_center(&self, height: u32) {
        let Some(renderer) = self.renderer.as_ref() else {
            return;
        };
        let Some(point) = ground_hit(self.camera.position, self.camera.direction) else {
            info!("No ground under the screen centre");
            return;
        };

        let vsm = renderer.vsm();
        let shadows = vsm.shadow_views(self.camera.position, sun_direction(self.sun_azimuth));
        let main = MainViewInfo::new(&self.camera, height);
        let request = classify_point(point, &main, &shadows, vsm.settings(), vsm.layout());

        let page_index = request.page.y * vsm.layout().pages_per_row + request.page.x;
        let handle = vsm.controller().levels()[request.level as usize].page(page_index);
        info!(
            x = point.x,
            y = point.y,
            z = point.z,
            level = request.level,
            page_x = request.page.x,
            page_y = request.page.y,
            resident = !handle.is_unbound(),
            "Inspected ground page"
        );
    }

    fn log_stats(&self) {
        let Some(renderer) = self.renderer.as_ref() else {
            return;
        };
        let stats = renderer.vsm().stats();
        let active_levels = (0..renderer.vsm().layout().levels as usize)
            .filter(|&level| !renderer.vsm().controller().is_level_empty(level))
            .count();
        info!(
            resident_pages = stats.resident_pages,
            free_pages = stats.free_pages,
            skipped = stats.skipped,
            binds = stats.binds,
            unbinds = stats.unbinds,
            active_levels,
            "Shadow residency"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn no_arguments_keep_defaults() {
        assert_eq!(ViewerParams::parse(Vec::new()), ViewerParams::default());
    }

    #[test]
    fn parses_every_flag() {
        let params = ViewerParams::parse(args(&[
            "--first-width",
            "8",
            "--lod-bias",
            "-1.5",
            "--debug",
            "page-residency",
            "--sun-speed",
            "0",
        ]));
        assert_eq!(params.settings.first_width, 8.0);
        assert_eq!(params.settings.lod_bias, -1.5);
        assert_eq!(params.debug_mode, DebugMode::PageResidency);
        assert_eq!(params.sun_speed, 0.0);
    }

    #[test]
    fn invalid_values_are_ignored() {
        let params = ViewerParams::parse(args(&["--first-width", "-3", "--debug", "nope", "--bogus"]));
        assert_eq!(params, ViewerParams::default());
    }
}
