use std::collections::HashMap;

use tracing::{debug, info, warn};
use web_sys::HtmlCanvasElement;
use wgpu::util::DeviceExt;

use slidescope_engine::{
    DeviceError, GraphicsDevice, Palette, PointBuffer, PointStyle, Projection, Rect, TextureHandle,
    TileImage,
};

// --- GPU data types ---

#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
struct Vertex {
    position: [f32; 2],
}

const QUAD_VERTICES: &[Vertex] = &[
    Vertex {
        position: [0.0, 0.0],
    },
    Vertex {
        position: [1.0, 0.0],
    },
    Vertex {
        position: [0.0, 1.0],
    },
    Vertex {
        position: [1.0, 1.0],
    },
];

const QUAD_INDICES: &[u16] = &[0, 1, 2, 2, 1, 3];

/// Shared by both pipelines: projection columns, CSS resolution and the
/// point style of the frame.
#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
struct FrameUniform {
    proj: [[f32; 4]; 3],
    resolution: [f32; 4],
    // size, ring width, aa band, palette length
    point: [f32; 4],
}

/// World rect of one tile draw: x, y, width, height.
#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
struct TileInstance {
    rect: [f32; 4],
}

#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
struct PointInstance {
    position: [f32; 2],
    category: f32,
}

struct GpuTile {
    texture: wgpu::Texture,
    bind_group: wgpu::BindGroup,
}

struct GpuPalette {
    bind_group: wgpu::BindGroup,
    len: u32,
}

enum DrawOp {
    Tile { id: u64, instance: u32 },
    Points { count: u32 },
}

/// Display list recorded between `begin_frame` and `end_frame`.
#[derive(Default)]
struct PendingFrame {
    projection: Projection,
    clear: [f32; 4],
    ops: Vec<DrawOp>,
    tile_rects: Vec<TileInstance>,
    point_style: Option<PointStyle>,
}

/// `GraphicsDevice` backed by wgpu on a WebGL2 canvas.
pub struct WgpuDevice {
    device: wgpu::Device,
    queue: wgpu::Queue,
    surface: wgpu::Surface<'static>,
    surface_config: wgpu::SurfaceConfiguration,

    // Shared geometry
    vertex_buffer: wgpu::Buffer,
    index_buffer: wgpu::Buffer,

    frame_buffer: wgpu::Buffer,
    frame_bind_group: wgpu::BindGroup,

    // Tile pipeline
    tile_pipeline: wgpu::RenderPipeline,
    tile_bind_group_layout: wgpu::BindGroupLayout,
    tile_sampler: wgpu::Sampler,
    tile_instances: wgpu::Buffer,
    tile_instance_capacity: u32,
    tiles: HashMap<u64, GpuTile>,
    next_texture_id: u64,

    // Point pipeline
    point_pipeline: wgpu::RenderPipeline,
    palette_bind_group_layout: wgpu::BindGroupLayout,
    point_instances: Option<(wgpu::Buffer, u32)>,
    palette: Option<GpuPalette>,

    pending: Option<PendingFrame>,
    lost: bool,

    width: u32,
    height: u32,
    dpr: f32,
}

impl WgpuDevice {
    /// Async initialization with a WebGL2-only path.
    pub async fn init(canvas: HtmlCanvasElement) -> Result<Self, String> {
        let width = canvas.width().max(1);
        let height = canvas.height().max(1);
        let rect = canvas.get_bounding_client_rect();
        let css_width = rect.width() as f32;
        let dpr = if css_width > 0.0 {
            (width as f32 / css_width).max(0.5)
        } else {
            web_sys::window()
                .map(|w| w.device_pixel_ratio() as f32)
                .unwrap_or(1.0)
        };

        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::GL,
            ..Default::default()
        });

        let surface = instance
            .create_surface(wgpu::SurfaceTarget::Canvas(canvas))
            .map_err(|e| format!("wgpu init create_surface: {e}"))?;

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: Some(&surface),
                ..Default::default()
            })
            .await
            .ok_or_else(|| "wgpu init: no suitable GPU adapter found".to_string())?;

        // WebGL2 adapters expose zero compute limits, so the plain default
        // limits fail validation.
        let required_limits =
            wgpu::Limits::downlevel_webgl2_defaults().using_resolution(adapter.limits());

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("slidescope-device"),
                    required_features: wgpu::Features::empty(),
                    required_limits,
                    ..Default::default()
                },
                None,
            )
            .await
            .map_err(|e| format!("wgpu init request_device: {e}"))?;

        let mut surface_config = surface
            .get_default_config(&adapter, width, height)
            .ok_or_else(|| "wgpu init: surface unsupported by adapter".to_string())?;
        let caps = surface.get_capabilities(&adapter);

        // Tiles are uploaded as Rgba8Unorm; a non-sRGB target avoids a second
        // gamma conversion.
        if let Some(format) = caps.formats.iter().copied().find(|f| !f.is_srgb()) {
            surface_config.format = format;
        }
        if caps.alpha_modes.contains(&wgpu::CompositeAlphaMode::Opaque) {
            surface_config.alpha_mode = wgpu::CompositeAlphaMode::Opaque;
        }
        let format = surface_config.format;
        info!(
            format = ?surface_config.format,
            present = ?surface_config.present_mode,
            alpha = ?surface_config.alpha_mode,
            width,
            height,
            dpr,
            "wgpu initialised on WebGL2"
        );
        surface.configure(&device, &surface_config);

        // --- Shared geometry ---
        let vertex_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("quad-verts"),
            contents: bytemuck::cast_slice(QUAD_VERTICES),
            usage: wgpu::BufferUsages::VERTEX,
        });
        let index_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("quad-indices"),
            contents: bytemuck::cast_slice(QUAD_INDICES),
            usage: wgpu::BufferUsages::INDEX,
        });

        // --- Frame uniform ---
        let frame_bind_group_layout =
            device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("frame-bgl"),
                entries: &[wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::VERTEX | wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                }],
            });
        let frame_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("frame-ubo"),
            size: std::mem::size_of::<FrameUniform>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let frame_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("frame-bg"),
            layout: &frame_bind_group_layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: frame_buffer.as_entire_binding(),
            }],
        });

        let vertex_layout = wgpu::VertexBufferLayout {
            array_stride: std::mem::size_of::<Vertex>() as u64,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: &[wgpu::VertexAttribute {
                offset: 0,
                shader_location: 0,
                format: wgpu::VertexFormat::Float32x2,
            }],
        };

        // --- Tile pipeline ---
        let tile_shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("tile-shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("tile.wgsl").into()),
        });
        let tile_bind_group_layout =
            device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("tile-bgl"),
                entries: &[
                    wgpu::BindGroupLayoutEntry {
                        binding: 0,
                        visibility: wgpu::ShaderStages::FRAGMENT,
                        ty: wgpu::BindingType::Texture {
                            sample_type: wgpu::TextureSampleType::Float { filterable: true },
                            view_dimension: wgpu::TextureViewDimension::D2,
                            multisampled: false,
                        },
                        count: None,
                    },
                    wgpu::BindGroupLayoutEntry {
                        binding: 1,
                        visibility: wgpu::ShaderStages::FRAGMENT,
                        ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                        count: None,
                    },
                ],
            });
        let tile_sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("tile-sampler"),
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            ..Default::default()
        });
        let tile_pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("tile-pl"),
            bind_group_layouts: &[&frame_bind_group_layout, &tile_bind_group_layout],
            push_constant_ranges: &[],
        });
        let tile_instance_layout = wgpu::VertexBufferLayout {
            array_stride: std::mem::size_of::<TileInstance>() as u64,
            step_mode: wgpu::VertexStepMode::Instance,
            attributes: &[wgpu::VertexAttribute {
                offset: 0,
                shader_location: 1,
                format: wgpu::VertexFormat::Float32x4,
            }],
        };
        let tile_pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("tile-pipeline"),
            layout: Some(&tile_pipeline_layout),
            vertex: wgpu::VertexState {
                module: &tile_shader,
                entry_point: Some("vs_main"),
                buffers: &[vertex_layout.clone(), tile_instance_layout],
                compilation_options: Default::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: &tile_shader,
                entry_point: Some("fs_main"),
                targets: &[Some(wgpu::ColorTargetState {
                    format,
                    blend: Some(wgpu::BlendState::ALPHA_BLENDING),
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: Default::default(),
            }),
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                cull_mode: None,
                ..Default::default()
            },
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
            cache: None,
        });
        let tile_instance_capacity = 256u32;
        let tile_instances = create_instance_buffer(&device, "tile-instances", tile_instance_capacity);

        // --- Point pipeline ---
        let point_shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("point-shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("points.wgsl").into()),
        });
        let palette_bind_group_layout =
            device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("palette-bgl"),
                entries: &[wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: false },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                }],
            });
        let point_pipeline_layout =
            device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("point-pl"),
                bind_group_layouts: &[&frame_bind_group_layout, &palette_bind_group_layout],
                push_constant_ranges: &[],
            });
        let point_instance_layout = wgpu::VertexBufferLayout {
            array_stride: std::mem::size_of::<PointInstance>() as u64,
            step_mode: wgpu::VertexStepMode::Instance,
            attributes: &[
                wgpu::VertexAttribute {
                    offset: 0,
                    shader_location: 1,
                    format: wgpu::VertexFormat::Float32x2, // position
                },
                wgpu::VertexAttribute {
                    offset: 8,
                    shader_location: 2,
                    format: wgpu::VertexFormat::Float32, // category
                },
            ],
        };
        let point_pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("point-pipeline"),
            layout: Some(&point_pipeline_layout),
            vertex: wgpu::VertexState {
                module: &point_shader,
                entry_point: Some("vs_main"),
                buffers: &[vertex_layout, point_instance_layout],
                compilation_options: Default::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: &point_shader,
                entry_point: Some("fs_main"),
                targets: &[Some(wgpu::ColorTargetState {
                    format,
                    blend: Some(wgpu::BlendState::ALPHA_BLENDING),
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: Default::default(),
            }),
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                cull_mode: None,
                ..Default::default()
            },
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
            cache: None,
        });

        Ok(Self {
            device,
            queue,
            surface,
            surface_config,
            vertex_buffer,
            index_buffer,
            frame_buffer,
            frame_bind_group,
            tile_pipeline,
            tile_bind_group_layout,
            tile_sampler,
            tile_instances,
            tile_instance_capacity,
            tiles: HashMap::new(),
            next_texture_id: 0,
            point_pipeline,
            palette_bind_group_layout,
            point_instances: None,
            palette: None,
            pending: None,
            lost: false,
            width,
            height,
            dpr,
        })
    }

    /// Resize the surface when the canvas backing store changes.
    pub fn resize(&mut self, width: u32, height: u32, dpr: f32) {
        if width == 0 || height == 0 {
            return;
        }
        self.width = width;
        self.height = height;
        self.dpr = dpr.max(0.5);
        self.surface_config.width = width;
        self.surface_config.height = height;
        if !self.lost {
            self.surface.configure(&self.device, &self.surface_config);
        }
    }

    /// The canvas reported a lost context; every later call fails with
    /// `DeviceError::Lost` until a new device replaces this one.
    pub fn mark_lost(&mut self) {
        self.lost = true;
        self.pending = None;
        self.tiles.clear();
        self.point_instances = None;
        self.palette = None;
    }

    fn check(&self) -> Result<(), DeviceError> {
        if self.lost {
            Err(DeviceError::Lost)
        } else {
            Ok(())
        }
    }

    fn upload_rgba(&self, label: &str, width: u32, height: u32, rgba: &[u8]) -> wgpu::Texture {
        let size = wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        };
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Unorm,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            rgba,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(4 * width),
                rows_per_image: Some(height),
            },
            size,
        );
        texture
    }

    fn frame_uniform(&self, frame: &PendingFrame) -> FrameUniform {
        let [c0, c1, c2] = frame.projection;
        let style = frame.point_style.unwrap_or(PointStyle::for_size(1.0));
        FrameUniform {
            proj: [
                [c0[0], c0[1], c0[2], 0.0],
                [c1[0], c1[1], c1[2], 0.0],
                [c2[0], c2[1], c2[2], 0.0],
            ],
            resolution: [
                self.width as f32 / self.dpr,
                self.height as f32 / self.dpr,
                0.0,
                0.0,
            ],
            point: [
                style.size,
                style.ring_width,
                style.aa_band,
                self.palette.as_ref().map_or(0.0, |p| p.len as f32),
            ],
        }
    }

    /// Submit the recorded display list in issue order.
    fn present(&mut self, frame: PendingFrame) -> Result<(), DeviceError> {
        // Buffer writes happen before the pass; mid-pass writes stall WebGL2.
        self.queue.write_buffer(
            &self.frame_buffer,
            0,
            bytemuck::cast_slice(&[self.frame_uniform(&frame)]),
        );
        let rect_count = frame.tile_rects.len() as u32;
        if rect_count > self.tile_instance_capacity {
            self.tile_instance_capacity = rect_count.next_power_of_two();
            self.tile_instances =
                create_instance_buffer(&self.device, "tile-instances", self.tile_instance_capacity);
        }
        if rect_count > 0 {
            self.queue.write_buffer(
                &self.tile_instances,
                0,
                bytemuck::cast_slice(&frame.tile_rects),
            );
        }

        let output = match self.surface.get_current_texture() {
            Ok(t) => t,
            Err(wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated) => {
                self.surface.configure(&self.device, &self.surface_config);
                return Ok(());
            }
            Err(wgpu::SurfaceError::Timeout) => return Ok(()),
            Err(e) => return Err(DeviceError::Backend(e.to_string())),
        };
        let view = output
            .texture
            .create_view(&wgpu::TextureViewDescriptor::default());
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("frame-encoder"),
            });

        {
            let [r, g, b, a] = frame.clear;
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("main-pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color {
                            r: r as f64,
                            g: g as f64,
                            b: b as f64,
                            a: a as f64,
                        }),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                ..Default::default()
            });
            pass.set_bind_group(0, &self.frame_bind_group, &[]);
            pass.set_vertex_buffer(0, self.vertex_buffer.slice(..));
            pass.set_index_buffer(self.index_buffer.slice(..), wgpu::IndexFormat::Uint16);

            let mut tile_pipeline_bound = false;
            for op in &frame.ops {
                match *op {
                    DrawOp::Tile { id, instance } => {
                        let Some(tile) = self.tiles.get(&id) else {
                            continue;
                        };
                        if !tile_pipeline_bound {
                            pass.set_pipeline(&self.tile_pipeline);
                            pass.set_vertex_buffer(1, self.tile_instances.slice(..));
                            tile_pipeline_bound = true;
                        }
                        pass.set_bind_group(1, &tile.bind_group, &[]);
                        pass.draw_indexed(0..6, 0, instance..instance + 1);
                    }
                    DrawOp::Points { count } => {
                        let (Some((buffer, uploaded)), Some(palette)) =
                            (&self.point_instances, &self.palette)
                        else {
                            continue;
                        };
                        pass.set_pipeline(&self.point_pipeline);
                        pass.set_bind_group(1, &palette.bind_group, &[]);
                        pass.set_vertex_buffer(1, buffer.slice(..));
                        pass.draw_indexed(0..6, 0, 0..count.min(*uploaded));
                        tile_pipeline_bound = false;
                    }
                }
            }
        }

        self.queue.submit(std::iter::once(encoder.finish()));
        output.present();
        Ok(())
    }
}

fn create_instance_buffer(device: &wgpu::Device, label: &str, capacity: u32) -> wgpu::Buffer {
    device.create_buffer(&wgpu::BufferDescriptor {
        label: Some(label),
        size: capacity as u64 * std::mem::size_of::<TileInstance>() as u64,
        usage: wgpu::BufferUsages::VERTEX | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    })
}

impl GraphicsDevice for WgpuDevice {
    fn create_texture(&mut self, image: &TileImage) -> Result<TextureHandle, DeviceError> {
        self.check()?;
        let max = self.device.limits().max_texture_dimension_2d;
        if image.width() > max || image.height() > max {
            return Err(DeviceError::InvalidImage(format!(
                "{}x{} exceeds the {max}px texture limit",
                image.width(),
                image.height()
            )));
        }
        let texture = self.upload_rgba("tile-tex", image.width(), image.height(), image.rgba());
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("tile-bg"),
            layout: &self.tile_bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(&view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::Sampler(&self.tile_sampler),
                },
            ],
        });
        self.next_texture_id += 1;
        let id = self.next_texture_id;
        self.tiles.insert(
            id,
            GpuTile {
                texture,
                bind_group,
            },
        );
        Ok(TextureHandle::new(id))
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        if let Some(tile) = self.tiles.remove(&texture.id()) {
            tile.texture.destroy();
        }
    }

    fn upload_points(&mut self, points: &PointBuffer) -> Result<(), DeviceError> {
        self.check()?;
        if points.is_empty() {
            self.point_instances = None;
            return Ok(());
        }
        let instances: Vec<PointInstance> = points
            .positions()
            .chunks_exact(2)
            .zip(points.palette_indices())
            .map(|(xy, &category)| PointInstance {
                position: [xy[0], xy[1]],
                category: category as f32,
            })
            .collect();
        let buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("point-instances"),
                contents: bytemuck::cast_slice(&instances),
                usage: wgpu::BufferUsages::VERTEX,
            });
        debug!(count = instances.len(), "uploaded point buffer");
        self.point_instances = Some((buffer, instances.len() as u32));
        Ok(())
    }

    fn upload_palette(&mut self, palette: &Palette) -> Result<(), DeviceError> {
        self.check()?;
        let len = palette.len() as u32;
        let max = self.device.limits().max_texture_dimension_2d;
        if len > max {
            return Err(DeviceError::Backend(format!(
                "palette of {len} entries exceeds the {max}px texture limit"
            )));
        }
        let texture = self.upload_rgba("palette-tex", len, 1, palette.rgba());
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("palette-bg"),
            layout: &self.palette_bind_group_layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: wgpu::BindingResource::TextureView(&view),
            }],
        });
        self.palette = Some(GpuPalette { bind_group, len });
        Ok(())
    }

    fn begin_frame(&mut self, projection: &Projection, clear: [f32; 4]) -> Result<(), DeviceError> {
        self.check()?;
        if self.pending.is_some() {
            warn!("begin_frame called twice; dropping the unfinished frame");
        }
        self.pending = Some(PendingFrame {
            projection: *projection,
            clear,
            ..PendingFrame::default()
        });
        Ok(())
    }

    fn draw_tile(&mut self, texture: &TextureHandle, bounds: Rect) {
        let Some(frame) = self.pending.as_mut() else {
            return;
        };
        let instance = frame.tile_rects.len() as u32;
        frame.tile_rects.push(TileInstance {
            rect: [
                bounds.x as f32,
                bounds.y as f32,
                bounds.w as f32,
                bounds.h as f32,
            ],
        });
        frame.ops.push(DrawOp::Tile {
            id: texture.id(),
            instance,
        });
    }

    fn draw_points(&mut self, count: u32, style: PointStyle) {
        let Some(frame) = self.pending.as_mut() else {
            return;
        };
        frame.point_style = Some(style);
        frame.ops.push(DrawOp::Points { count });
    }

    fn end_frame(&mut self) -> Result<(), DeviceError> {
        self.check()?;
        let Some(frame) = self.pending.take() else {
            return Ok(());
        };
        self.present(frame)
    }
}
