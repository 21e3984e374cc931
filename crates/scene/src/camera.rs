//! Camera and fly-through controller.
//!
//! Projections use a right-handed view space with depth in `[0, 1]`. The
//! Vulkan backend flips its viewport, so no Y flip is baked in here.

use glam::{EulerRot, Mat4, Quat, Vec3};

/// Projection type for the camera.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Projection {
    Perspective {
        fov_y: f32,
        aspect: f32,
        near: f32,
        far: f32,
    },
    Orthographic {
        half_height: f32,
        aspect: f32,
        near: f32,
        far: f32,
    },
}

/// A camera for rendering the scene.
#[derive(Clone, Debug)]
pub struct Camera {
    /// Camera position in world space
    pub position: Vec3,
    pub rotation: Quat,
    pub projection: Projection,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            position: Vec3::new(0.0, 0.0, 5.0),
            rotation: Quat::IDENTITY,
            projection: Projection::Perspective {
                fov_y: 45.0_f32.to_radians(),
                aspect: 16.0 / 9.0,
                near: 0.1,
                far: 1000.0,
            },
        }
    }
}

impl Camera {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update the aspect ratio, typically after a resize.
    pub fn set_aspect(&mut self, new_aspect: f32) {
        match &mut self.projection {
            Projection::Perspective { aspect, .. } | Projection::Orthographic { aspect, .. } => {
                *aspect = new_aspect;
            }
        }
    }

    pub fn aspect(&self) -> f32 {
        match self.projection {
            Projection::Perspective { aspect, .. } | Projection::Orthographic { aspect, .. } => aspect,
        }
    }

    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_to_rh(self.position, self.forward(), self.up())
    }

    pub fn projection_matrix(&self) -> Mat4 {
        match self.projection {
            Projection::Perspective {
                fov_y,
                aspect,
                near,
                far,
            } => Mat4::perspective_rh(fov_y, aspect, near, far),
            Projection::Orthographic {
                half_height,
                aspect,
                near,
                far,
            } => {
                let half_width = half_height * aspect;
                Mat4::orthographic_rh(-half_width, half_width, -half_height, half_height, near, far)
            }
        }
    }

    pub fn view_projection_matrix(&self) -> Mat4 {
        self.projection_matrix() * self.view_matrix()
    }

    pub fn forward(&self) -> Vec3 {
        self.rotation * Vec3::NEG_Z
    }

    pub fn right(&self) -> Vec3 {
        self.rotation * Vec3::X
    }

    pub fn up(&self) -> Vec3 {
        self.rotation * Vec3::Y
    }

    /// Turns the camera toward `target` keeping +Y up.
    pub fn look_at(&mut self, target: Vec3) {
        let Some(forward) = (target - self.position).try_normalize() else {
            return;
        };
        let yaw = (-forward.x).atan2(-forward.z);
        let pitch = forward.y.clamp(-1.0, 1.0).asin();
        self.rotation = Quat::from_euler(EulerRot::YXZ, yaw, pitch, 0.0);
    }

    /// Places the camera in front of a bounding box so all of it is visible.
    pub fn frame_bounds(&mut self, min: Vec3, max: Vec3) {
        let center = (min + max) * 0.5;
        let radius = ((max - min).length() * 0.5).max(0.5);
        let fov_y = match self.projection {
            Projection::Perspective { fov_y, .. } => fov_y,
            Projection::Orthographic { .. } => 45.0_f32.to_radians(),
        };
        let distance = radius / (fov_y * 0.5).sin();
        self.position = center + Vec3::new(0.0, radius * 0.25, distance);
        self.look_at(center);
    }
}

/// Movement directions driven by held keys.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Movement {
    Forward,
    Backward,
    Left,
    Right,
    Up,
    Down,
}

impl Movement {
    const ALL: [Self; 6] = [
        Self::Forward,
        Self::Backward,
        Self::Left,
        Self::Right,
        Self::Up,
        Self::Down,
    ];

    fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

/// First-person fly controller.
///
/// Keys set movement flags, mouse motion accumulates yaw and pitch, and
/// [`FlyController::update`] applies both to a camera once per tick.
#[derive(Clone, Debug)]
pub struct FlyController {
    /// Units per second.
    pub speed: f32,
    /// Radians per pixel of mouse motion.
    pub sensitivity: f32,
    yaw: f32,
    pitch: f32,
    held: u8,
}

impl Default for FlyController {
    fn default() -> Self {
        Self {
            speed: 3.0,
            sensitivity: 0.0025,
            yaw: 0.0,
            pitch: 0.0,
            held: 0,
        }
    }
}

impl FlyController {
    const PITCH_LIMIT: f32 = 1.55;

    /// A controller starting from the camera's current orientation.
    pub fn from_camera(camera: &Camera) -> Self {
        let (yaw, pitch, _) = camera.rotation.to_euler(EulerRot::YXZ);
        Self {
            yaw,
            pitch,
            ..Default::default()
        }
    }

    pub fn set_movement(&mut self, movement: Movement, pressed: bool) {
        if pressed {
            self.held |= movement.bit();
        } else {
            self.held &= !movement.bit();
        }
    }

    pub fn is_moving(&self, movement: Movement) -> bool {
        self.held & movement.bit() != 0
    }

    /// Releases every key, e.g. when the window loses focus.
    pub fn release_all(&mut self) {
        self.held = 0;
    }

    pub fn on_mouse_move(&mut self, dx: f32, dy: f32) {
        self.yaw -= dx * self.sensitivity;
        self.pitch = (self.pitch - dy * self.sensitivity).clamp(-Self::PITCH_LIMIT, Self::PITCH_LIMIT);
    }

    /// Applies orientation and movement for a tick of `dt` seconds.
    pub fn update(&self, camera: &mut Camera, dt: f32) {
        camera.rotation = Quat::from_euler(EulerRot::YXZ, self.yaw, self.pitch, 0.0);

        let mut direction = Vec3::ZERO;
        for movement in Movement::ALL {
            if !self.is_moving(movement) {
                continue;
            }
            direction += match movement {
                Movement::Forward => camera.forward(),
                Movement::Backward => -camera.forward(),
                Movement::Right => camera.right(),
                Movement::Left => -camera.right(),
                Movement::Up => Vec3::Y,
                Movement::Down => Vec3::NEG_Y,
            };
        }
        if let Some(direction) = direction.try_normalize() {
            camera.position += direction * self.speed * dt;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: Vec3, b: Vec3) -> bool {
        (a - b).length() < 1e-4
    }

    #[test]
    fn test_default_camera_looks_down_negative_z() {
        let camera = Camera::new();
        assert!(approx(camera.forward(), Vec3::NEG_Z));
        let origin = camera.view_matrix().transform_point3(Vec3::ZERO);
        assert!(approx(origin, Vec3::new(0.0, 0.0, -5.0)));
    }

    #[test]
    fn test_perspective_depth_range() {
        let camera = Camera::new();
        let proj = camera.projection_matrix();
        let near = proj.project_point3(Vec3::new(0.0, 0.0, -0.1));
        let far = proj.project_point3(Vec3::new(0.0, 0.0, -1000.0));
        assert!(near.z.abs() < 1e-4);
        assert!((far.z - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_look_at() {
        let mut camera = Camera::new();
        camera.position = Vec3::new(5.0, 0.0, 0.0);
        camera.look_at(Vec3::ZERO);
        assert!(approx(camera.forward(), Vec3::NEG_X));
        assert!(camera.up().y > 0.99);
    }

    #[test]
    fn test_set_aspect() {
        let mut camera = Camera::new();
        camera.set_aspect(4.0 / 3.0);
        assert_eq!(camera.aspect(), 4.0 / 3.0);
    }

    #[test]
    fn test_frame_bounds_sees_center() {
        let mut camera = Camera::new();
        camera.frame_bounds(Vec3::splat(-1.0), Vec3::splat(1.0));
        let to_center = (Vec3::ZERO - camera.position).normalize();
        assert!(approx(camera.forward(), to_center));
    }

    #[test]
    fn test_fly_forward() {
        let mut camera = Camera::new();
        let mut fly = FlyController::from_camera(&camera);
        fly.set_movement(Movement::Forward, true);
        fly.update(&mut camera, 1.0);
        assert!(approx(camera.position, Vec3::new(0.0, 0.0, 5.0 - fly.speed)));

        fly.set_movement(Movement::Forward, false);
        fly.update(&mut camera, 1.0);
        assert!(approx(camera.position, Vec3::new(0.0, 0.0, 5.0 - fly.speed)));
    }

    #[test]
    fn test_opposite_keys_cancel() {
        let mut camera = Camera::new();
        let mut fly = FlyController::default();
        fly.set_movement(Movement::Left, true);
        fly.set_movement(Movement::Right, true);
        fly.update(&mut camera, 1.0);
        assert!(approx(camera.position, Vec3::new(0.0, 0.0, 5.0)));
    }

    #[test]
    fn test_pitch_is_clamped() {
        let mut camera = Camera::new();
        let mut fly = FlyController::default();
        fly.on_mouse_move(0.0, -1.0e6);
        fly.update(&mut camera, 0.0);
        assert!(camera.forward().y < 1.0);
        assert!(camera.forward().y > 0.99);
    }
}
