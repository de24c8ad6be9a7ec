use log::{error, info};
use winit::application::ApplicationHandler;
use winit::event::{DeviceEvent, DeviceId, ElementState, WindowEvent};
use winit::event_loop::ActiveEventLoop;
use winit::keyboard::{Key, NamedKey};
use winit::window::{Window, WindowId};

use crate::camera::Camera;
use crate::renderer::Renderer;
use crate::settings::RenderSettings;
use crate::time::FrameTimer;

/// Winit application shell: owns the window, the renderer and the camera,
/// and forwards events between them.
///
/// Field order matters: the renderer holds a surface for the window and
/// must drop first.
pub struct App {
    settings: RenderSettings,
    renderer: Option<Renderer>,
    window: Option<Window>,
    camera: Option<Camera>,
    timer: FrameTimer,
}

impl App {
    pub fn new(settings: RenderSettings) -> Self {
        Self {
            settings,
            renderer: None,
            window: None,
            camera: None,
            timer: FrameTimer::new(),
        }
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let attributes = Window::default_attributes()
            .with_title("photometric")
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.settings.resolution.width,
                self.settings.resolution.height,
            ));
        let window = match event_loop.create_window(attributes) {
            Ok(window) => window,
            Err(err) => {
                error!("Cannot create a window: {err}");
                event_loop.exit();
                return;
            }
        };

        let mut renderer = match Renderer::new(&window, self.settings.clone()) {
            Ok(renderer) => renderer,
            Err(err) => {
                error!("Cannot create the renderer: {err}");
                event_loop.exit();
                return;
            }
        };

        for scene in &self.settings.scenes {
            renderer.add_gltf_asset(scene);
        }

        self.camera = Some(Camera::new(renderer.aspect_ratio()));
        self.renderer = Some(renderer);
        self.window = Some(window);
        info!("Application started");
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _window_id: WindowId,
        event: WindowEvent,
    ) {
        let (Some(renderer), Some(camera)) = (self.renderer.as_mut(), self.camera.as_mut()) else {
            return;
        };

        match event {
            WindowEvent::CloseRequested => event_loop.exit(),
            WindowEvent::Resized(size) => {
                renderer.resize_screen(size.width, size.height);
                camera.set_proj(renderer.aspect_ratio());
            }
            WindowEvent::KeyboardInput { event, .. } => {
                if event.state == ElementState::Pressed {
                    match &event.logical_key {
                        Key::Named(NamedKey::Escape) => {
                            event_loop.exit();
                            return;
                        }
                        Key::Character(c) if c.as_str() == "r" => {
                            renderer.recompile_pipelines();
                            return;
                        }
                        _ => {}
                    }
                }
                camera.process_key(&event.logical_key, event.state);
            }
            WindowEvent::RedrawRequested => {
                let dt = self.timer.tick();
                camera.update(dt);
                renderer.draw(camera, dt);
                if let Some(window) = &self.window {
                    window.request_redraw();
                }
            }
            _ => {}
        }
    }

    fn device_event(
        &mut self,
        _event_loop: &ActiveEventLoop,
        _device_id: DeviceId,
        event: DeviceEvent,
    ) {
        if let DeviceEvent::MouseMotion { delta: (dx, dy) } = event {
            if let Some(camera) = self.camera.as_mut() {
                camera.process_mouse(dx, dy);
            }
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(window) = &self.window {
            window.request_redraw();
        }
    }
}
