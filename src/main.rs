// =============================================================================
// KILN - Bindless Vulkan frame renderer
// =============================================================================
//
// Thin application shell around the renderer core: window creation, event
// pumping, a demo scene standing in for the asset layer, and FPS tracking.
// Everything GPU-facing lives behind `Renderer`.
//
// FRAME FLOW:
// 1. Build the frame's render snapshot (static scene only on first frame)
// 2. Renderer: acquire image, gate on the slot's fence token, recycle slot
// 3. Record constants/bindless views/draws through the slot's heaps
// 4. Submit, present, signal, advance to the next reported slot
//
// =============================================================================

mod arena;
mod backend;
mod config;
mod renderer;
mod snapshot;

use anyhow::Result;
use config::Config;
use glam::{Mat4, Vec3, Vec4};
use renderer::Renderer;
use snapshot::{
    Attributes, ByteView, DrawConstants, FrameConstants, ImageView, Light, PixelFormat,
    RenderSnapshot, StaticScene, Vertex,
};
use std::sync::Arc;
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Fullscreen, Window, WindowAttributes},
};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    init_logging();

    let config = Config::load();
    log::info!("Starting renderer");
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen { "fullscreen" } else { "windowed" }
    );
    log::info!("Vsync: {}", config.graphics.vsync);

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;
    Ok(())
}

fn init_logging() {
    use env_logger::Builder;
    use log::LevelFilter;

    let mut builder = Builder::from_default_env();
    builder.filter_level(LevelFilter::Info);
    builder.init();
}

// =============================================================================
// DEMO SCENE
// =============================================================================
// Stands in for the asset/scene layer: a unit cube with one generated
// texture. The renderer only ever sees the byte views.

struct DemoScene {
    vertices: Vec<Vertex>,
    attributes: Vec<Attributes>,
    indices: Vec<u16>,
    texture: Vec<u8>,
    texture_size: u32,
}

impl DemoScene {
    fn new() -> Self {
        let corners = [
            Vec3::new(-1.0, -1.0, -1.0),
            Vec3::new(1.0, -1.0, -1.0),
            Vec3::new(1.0, 1.0, -1.0),
            Vec3::new(-1.0, 1.0, -1.0),
            Vec3::new(-1.0, -1.0, 1.0),
            Vec3::new(1.0, -1.0, 1.0),
            Vec3::new(1.0, 1.0, 1.0),
            Vec3::new(-1.0, 1.0, 1.0),
        ];

        let vertices: Vec<Vertex> = corners
            .iter()
            .map(|&p| Vertex {
                position: p.extend(1.0),
            })
            .collect();

        let attributes: Vec<Attributes> = corners
            .iter()
            .map(|&p| Attributes {
                tangent: Vec4::new(1.0, 0.0, 0.0, 0.0),
                normal: p.normalize().extend(0.0),
                uv: Vec4::new(p.x * 0.5 + 0.5, p.y * 0.5 + 0.5, 0.0, 0.0),
            })
            .collect();

        // CCW winding viewed from outside, matching the pipeline's
        // front-face setting.
        #[rustfmt::skip]
        let indices: Vec<u16> = vec![
            4, 5, 6,  6, 7, 4, // +z
            1, 0, 3,  3, 2, 1, // -z
            0, 4, 7,  7, 3, 0, // -x
            5, 1, 2,  2, 6, 5, // +x
            7, 6, 2,  2, 3, 7, // +y
            0, 1, 5,  5, 4, 0, // -y
        ];

        let texture_size = 256u32;
        let texture = checkerboard_rgba8(texture_size, 8);

        Self {
            vertices,
            attributes,
            indices,
            texture,
            texture_size,
        }
    }

    fn static_scene(&self) -> StaticScene<'_> {
        StaticScene {
            positions: ByteView::from_slice(&self.vertices),
            attributes: ByteView::from_slice(&self.attributes),
            indices: ByteView::from_slice(&self.indices),
            textures: vec![ImageView {
                bytes: &self.texture,
                width: self.texture_size,
                height: self.texture_size,
                mip_count: 1,
                format: PixelFormat::Rgba8Srgb,
            }],
        }
    }
}

fn checkerboard_rgba8(size: u32, cell: u32) -> Vec<u8> {
    let mut bytes = Vec::with_capacity((size * size * 4) as usize);
    for y in 0..size {
        for x in 0..size {
            let dark = ((x / cell) + (y / cell)) % 2 == 0;
            if dark {
                bytes.extend_from_slice(&[60, 60, 70, 255]);
            } else {
                bytes.extend_from_slice(&[220, 210, 190, 255]);
            }
        }
    }
    bytes
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

struct App {
    config: Config,

    // Renderer before window: the surface must die before the window does.
    renderer: Option<Renderer>,
    window: Option<Arc<Window>>,
    is_fullscreen: bool,

    scene: DemoScene,
    scene_uploaded: bool,
    start_time: Instant,

    // FPS tracking
    frame_count: u32,
    last_fps_update: Instant,
    last_frame_time: Instant,
}

impl App {
    fn new(config: Config) -> Self {
        let is_fullscreen = config.window.fullscreen;
        let now = Instant::now();
        Self {
            config,
            renderer: None,
            window: None,
            is_fullscreen,
            scene: DemoScene::new(),
            scene_uploaded: false,
            start_time: now,
            frame_count: 0,
            last_fps_update: now,
            last_frame_time: now,
        }
    }

    fn init_renderer(&mut self, window: Arc<Window>) -> Result<()> {
        use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};

        let size = window.inner_size();
        let display_handle = window.as_ref().raw_display_handle();
        let window_handle = window.as_ref().raw_window_handle();

        let renderer = Renderer::new(
            &self.config,
            display_handle,
            window_handle,
            size.width,
            size.height,
        )?;

        self.renderer = Some(renderer);
        self.window = Some(window);
        Ok(())
    }

    /// Build this frame's snapshot and hand it to the renderer.
    fn draw(&mut self) -> Result<bool> {
        let (Some(renderer), Some(window)) = (self.renderer.as_mut(), self.window.as_ref()) else {
            return Ok(false);
        };

        let size = window.inner_size();
        let aspect = if size.height > 0 {
            size.width as f32 / size.height as f32
        } else {
            1.0
        };

        let time = self.start_time.elapsed().as_secs_f32();
        let eye = Vec3::new(4.0 * time.cos(), 2.5, 4.0 * time.sin());
        let view = Mat4::look_at_rh(eye, Vec3::ZERO, Vec3::Y);
        let proj = Mat4::perspective_rh(60f32.to_radians(), aspect, 0.1, 100.0);
        let world_to_clip = proj * view;

        let frame = FrameConstants {
            lights: [
                Light {
                    pos: Vec4::new(3.0, 3.0, 3.0, 0.0),
                    radiance: Vec4::new(1.0, 0.95, 0.9, 40.0),
                },
                Light {
                    pos: Vec4::new(-3.0, 2.0, -2.0, 0.0),
                    radiance: Vec4::new(0.4, 0.5, 1.0, 25.0),
                },
                Light::default(),
                Light::default(),
            ],
            view_pos: eye.extend(1.0),
        };
        let draw = DrawConstants {
            obj_to_world: Mat4::IDENTITY,
            world_to_clip,
            clip_to_world: world_to_clip.inverse(),
        };

        // The static scene rides along exactly once; the renderer flushes
        // around the upload.
        let upload_scene = !self.scene_uploaded;
        let scene = if upload_scene {
            Some(self.scene.static_scene())
        } else {
            None
        };

        let snapshot = RenderSnapshot { scene, frame, draw };
        let rendered = renderer.render_frame(&snapshot, size.width, size.height)?;
        if upload_scene {
            self.scene_uploaded = true;
        }
        Ok(rendered)
    }

    fn toggle_fullscreen(&mut self) {
        if let Some(ref window) = self.window {
            self.is_fullscreen = !self.is_fullscreen;

            if self.is_fullscreen {
                window.set_fullscreen(Some(Fullscreen::Borderless(None)));
                log::info!("Entered fullscreen mode");
            } else {
                window.set_fullscreen(None);
                log::info!("Exited fullscreen mode");
            }
        }
    }

    fn update_fps(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }

        let now = Instant::now();
        let frame_time = now.duration_since(self.last_frame_time).as_secs_f32();
        self.last_frame_time = now;
        self.frame_count += 1;

        // Update title every second
        if now.duration_since(self.last_fps_update).as_secs_f32() >= 1.0 {
            let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
            let fps = self.frame_count as f32 / elapsed;

            if let Some(ref window) = self.window {
                window.set_title(&format!(
                    "{} - {:.0} FPS ({:.2}ms)",
                    self.config.window.title,
                    fps,
                    frame_time * 1000.0,
                ));
            }

            self.frame_count = 0;
            self.last_fps_update = now;
        }
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let mut window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        if self.config.window.fullscreen {
            window_attributes =
                window_attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                log::error!("Failed to create window: {:?}", e);
                event_loop.exit();
                return;
            }
        };

        // A renderer that cannot initialize is fatal.
        if let Err(e) = self.init_renderer(window) {
            log::error!("Failed to initialize renderer: {:?}", e);
            event_loop.exit();
        }
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                // The renderer compares dimensions each frame and rebuilds
                // its targets behind a full flush.
            }

            WindowEvent::RedrawRequested => match self.draw() {
                Ok(rendered) => {
                    if rendered {
                        self.update_fps();
                    }
                }
                Err(e) => {
                    // A failed frame means a broken command stream.
                    log::error!("Render error: {:?}", e);
                    event_loop.exit();
                }
            },

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed() {
                    if let PhysicalKey::Code(key) = event.physical_key {
                        match key {
                            KeyCode::Escape => {
                                log::info!("ESC pressed, exiting...");
                                event_loop.exit();
                            }
                            KeyCode::F11 => {
                                self.toggle_fullscreen();
                            }
                            _ => {}
                        }
                    }
                }
            }

            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}
