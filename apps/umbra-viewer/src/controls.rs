//! Keyboard and mouse state plus the free-fly camera.

use glam::{Vec2, Vec3};
use hashbrown::HashSet;
use umbra_app::{Camera, DeviceEvent, ElementState, KeyCode, PhysicalKey, WindowEvent};
use winit::window::{CursorGrabMode, Window};

/// Camera movement speed in units per second.
const CAMERA_SPEED: f32 = 12.0;

/// Camera sprint multiplier.
const CAMERA_SPRINT_MULT: f32 = 3.0;

/// Mouse sensitivity for camera rotation (radians per pixel).
const MOUSE_SENSITIVITY: f32 = 0.002;

const PITCH_LIMIT: f32 = std::f32::consts::FRAC_PI_2 - 0.01;

/// Keys held and pressed this frame, and accumulated mouse motion.
#[derive(Debug, Default)]
pub struct Controls {
    held: HashSet<KeyCode>,
    pressed: HashSet<KeyCode>,
    mouse_delta: Vec2,
    cursor_locked: bool,
}

impl Controls {
    /// Returns `true` if the event was consumed.
    pub fn process_window_event(&mut self, event: &WindowEvent) -> bool {
        match event {
            WindowEvent::KeyboardInput { event, .. } => {
                let PhysicalKey::Code(code) = event.physical_key else {
                    return false;
                };
                match event.state {
                    ElementState::Pressed if !event.repeat => self.press(code),
                    ElementState::Pressed => {}
                    ElementState::Released => self.release(code),
                }
                true
            }
            WindowEvent::Focused(false) => {
                self.held.clear();
                false
            }
            _ => false,
        }
    }

    pub fn process_device_event(&mut self, event: &DeviceEvent) {
        if let DeviceEvent::MouseMotion { delta } = event {
            if self.cursor_locked {
                self.mouse_delta += Vec2::new(delta.0 as f32, delta.1 as f32);
            }
        }
    }

    pub(crate) fn press(&mut self, key: KeyCode) {
        if self.held.insert(key) {
            self.pressed.insert(key);
        }
    }

    pub(crate) fn release(&mut self, key: KeyCode) {
        self.held.remove(&key);
    }

    pub fn is_held(&self, key: KeyCode) -> bool {
        self.held.contains(&key)
    }

    /// Pressed since the last [`end_frame`](Self::end_frame).
    pub fn was_pressed(&self, key: KeyCode) -> bool {
        self.pressed.contains(&key)
    }

    pub const fn mouse_delta(&self) -> Vec2 {
        self.mouse_delta
    }

    pub const fn cursor_locked(&self) -> bool {
        self.cursor_locked
    }

    pub fn set_cursor_locked(&mut self, window: &Window, locked: bool) {
        self.cursor_locked = locked;
        self.mouse_delta = Vec2::ZERO;
        apply_cursor_lock(window, locked);
    }

    /// Forget per-frame input.
    pub fn end_frame(&mut self) {
        self.pressed.clear();
        self.mouse_delta = Vec2::ZERO;
    }
}

/// Yaw/pitch state driving a [`Camera`].
#[derive(Debug, Clone, Copy)]
pub struct FlyCamera {
    yaw: f32,
    pitch: f32,
}

impl FlyCamera {
    /// Angles matching the camera's current direction.
    pub fn from_camera(camera: &Camera) -> Self {
        let dir = camera.direction.normalize_or_zero();
        Self {
            yaw: dir.z.atan2(dir.x),
            pitch: dir.y.clamp(-1.0, 1.0).asin().clamp(-PITCH_LIMIT, PITCH_LIMIT),
        }
    }

    /// Apply mouse look and WASD movement for `dt` seconds.
    pub fn update(&mut self, camera: &mut Camera, controls: &Controls, dt: f32) {
        if controls.cursor_locked() {
            let delta = controls.mouse_delta() * MOUSE_SENSITIVITY;
            self.yaw += delta.x;
            self.pitch = (self.pitch - delta.y).clamp(-PITCH_LIMIT, PITCH_LIMIT);
        }
        camera.set_orientation(self.yaw, self.pitch);

        let forward = Vec3::new(camera.direction.x, 0.0, camera.direction.z).normalize_or_zero();
        let right = forward.cross(Vec3::Y).normalize_or_zero();

        let bindings = [
            (KeyCode::KeyW, forward),
            (KeyCode::ArrowUp, forward),
            (KeyCode::KeyS, -forward),
            (KeyCode::ArrowDown, -forward),
            (KeyCode::KeyD, right),
            (KeyCode::ArrowRight, right),
            (KeyCode::KeyA, -right),
            (KeyCode::ArrowLeft, -right),
            (KeyCode::Space, Vec3::Y),
            (KeyCode::ControlLeft, Vec3::NEG_Y),
        ];
        let movement: Vec3 = bindings
            .iter()
            .filter(|(key, _)| controls.is_held(*key))
            .map(|(_, direction)| *direction)
            .sum();

        if movement != Vec3::ZERO {
            let speed = if controls.is_held(KeyCode::ShiftLeft) {
                CAMERA_SPEED * CAMERA_SPRINT_MULT
            } else {
                CAMERA_SPEED
            };
            camera.position += movement.normalize() * speed * dt;
        }
    }
}

fn apply_cursor_lock(window: &Window, locked: bool) {
    let (grab_mode, visible) = if locked {
        (CursorGrabMode::Locked, false)
    } else {
        (CursorGrabMode::None, true)
    };

    // Not every platform supports locking, fall back to confining
    if let Err(e) = window.set_cursor_grab(grab_mode) {
        if grab_mode == CursorGrabMode::Locked {
            if let Err(e2) = window.set_cursor_grab(CursorGrabMode::Confined) {
                tracing::warn!("Failed to confine cursor: {e2}");
            }
        } else {
            tracing::warn!("Failed to set cursor grab mode: {e}");
        }
    }
    window.set_cursor_visible(visible);
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn pressed_is_reported_once() {
        let mut controls = Controls::default();
        controls.press(KeyCode::F3);
        assert!(controls.was_pressed(KeyCode::F3));
        controls.end_frame();
        assert!(!controls.was_pressed(KeyCode::F3));
        assert!(controls.is_held(KeyCode::F3));

        // Held keys do not trigger again
        controls.press(KeyCode::F3);
        assert!(!controls.was_pressed(KeyCode::F3));
        controls.release(KeyCode::F3);
        assert!(!controls.is_held(KeyCode::F3));
    }

    #[test]
    fn fly_camera_keeps_initial_direction() {
        let mut camera = Camera::looking_at(Vec3::new(0.0, 5.0, 10.0), Vec3::ZERO, 1.0);
        let expected = camera.direction;
        let mut fly = FlyCamera::from_camera(&camera);
        fly.update(&mut camera, &Controls::default(), 0.016);
        assert_relative_eq!(camera.direction.x, expected.x, epsilon = 1e-5);
        assert_relative_eq!(camera.direction.y, expected.y, epsilon = 1e-5);
        assert_relative_eq!(camera.direction.z, expected.z, epsilon = 1e-5);
        assert_eq!(camera.position, Vec3::new(0.0, 5.0, 10.0));
    }

    #[test]
    fn forward_moves_along_ground() {
        let mut camera = Camera::looking_at(Vec3::new(0.0, 5.0, 0.0), Vec3::new(0.0, 0.0, -5.0), 1.0);
        let mut fly = FlyCamera::from_camera(&camera);
        let mut controls = Controls::default();
        controls.press(KeyCode::KeyW);
        fly.update(&mut camera, &controls, 1.0);

        assert_relative_eq!(camera.position.y, 5.0, epsilon = 1e-5);
        assert_relative_eq!(camera.position.z, -CAMERA_SPEED, epsilon = 1e-4);
    }
}
