use glam::{Mat4, Vec3};
use winit::event::ElementState;
use winit::keyboard::{Key, NamedKey};

const MOVE_SPEED: f32 = 8.0;
const LOOK_SENSITIVITY: f32 = 0.002;

/// Free-fly camera. Thin collaborator of the renderer: it only supplies
/// view/projection matrices and the eye position for the scene constants.
pub struct Camera {
    pub eye: Vec3,
    yaw: f32,
    pitch: f32,
    proj: Mat4,
    move_forward: f32,
    move_right: f32,
    move_up: f32,
}

impl Camera {
    pub fn new(aspect_ratio: f32) -> Self {
        let mut camera = Self {
            eye: Vec3::new(0.0, 2.0, 6.0),
            yaw: 0.0,
            pitch: 0.0,
            proj: Mat4::IDENTITY,
            move_forward: 0.0,
            move_right: 0.0,
            move_up: 0.0,
        };
        camera.set_proj(aspect_ratio);
        camera
    }

    /// Reverse-Z perspective: near and far are swapped so depth 1.0 is the
    /// near plane, matching the GREATER_OR_EQUAL depth test in the renderer.
    pub fn set_proj(&mut self, aspect_ratio: f32) {
        let mut proj = Mat4::perspective_rh(70f32.to_radians(), aspect_ratio, 10000.0, 0.01);
        // glTF is +Y up, Vulkan clip space is +Y down
        proj.y_axis.y *= -1.0;
        self.proj = proj;
    }

    pub fn proj(&self) -> Mat4 {
        self.proj
    }

    pub fn view(&self) -> Mat4 {
        Mat4::look_to_rh(self.eye, self.forward(), Vec3::Y)
    }

    fn forward(&self) -> Vec3 {
        Vec3::new(
            self.yaw.sin() * self.pitch.cos(),
            self.pitch.sin(),
            -self.yaw.cos() * self.pitch.cos(),
        )
    }

    pub fn update(&mut self, dt: f32) {
        let forward = self.forward();
        let right = forward.cross(Vec3::Y).normalize_or_zero();
        self.eye += forward * self.move_forward * MOVE_SPEED * dt;
        self.eye += right * self.move_right * MOVE_SPEED * dt;
        self.eye += Vec3::Y * self.move_up * MOVE_SPEED * dt;
    }

    pub fn process_key(&mut self, key: &Key, state: ElementState) {
        let value = if state == ElementState::Pressed {
            1.0
        } else {
            0.0
        };
        match key {
            Key::Character(c) => match c.as_str() {
                "w" | "W" => self.move_forward = value,
                "s" | "S" => self.move_forward = -value,
                "d" | "D" => self.move_right = value,
                "a" | "A" => self.move_right = -value,
                _ => {}
            },
            Key::Named(NamedKey::Space) => self.move_up = value,
            Key::Named(NamedKey::Shift) => self.move_up = -value,
            _ => {}
        }
    }

    pub fn process_mouse(&mut self, dx: f64, dy: f64) {
        self.yaw += dx as f32 * LOOK_SENSITIVITY;
        self.pitch = (self.pitch - dy as f32 * LOOK_SENSITIVITY)
            .clamp(-89f32.to_radians(), 89f32.to_radians());
    }
}
