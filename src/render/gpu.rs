//! wgpu textured-quad renderer drawing into an offscreen target

use std::mem::size_of;

use bytemuck::{Pod, Zeroable};
use tracing::{info, instrument};
use wgpu::util::DeviceExt;
use wgpu::*;

use crate::capture::frame::Resolution;
use crate::convert::ProcessedFrame;
use crate::render::{FrameRenderer, RenderError};

const SHADER_SOURCE: &str = r#"
struct Transform {
    mvp: mat4x4<f32>,
};

@group(0) @binding(0) var<uniform> transform: Transform;
@group(0) @binding(1) var frame_texture: texture_2d<f32>;
@group(0) @binding(2) var frame_sampler: sampler;

struct VertexOutput {
    @builtin(position) position: vec4<f32>,
    @location(0) tex_coords: vec2<f32>,
};

@vertex
fn vs_main(@location(0) position: vec2<f32>, @location(1) tex_coords: vec2<f32>) -> VertexOutput {
    var out: VertexOutput;
    out.position = transform.mvp * vec4<f32>(position, 0.0, 1.0);
    out.tex_coords = tex_coords;
    return out;
}

@fragment
fn fs_main(in: VertexOutput) -> @location(0) vec4<f32> {
    return textureSample(frame_texture, frame_sampler, in.tex_coords);
}
"#;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct Vertex {
    position: [f32; 2],
    tex_coords: [f32; 2],
}

impl Vertex {
    const ATTRIBUTES: [VertexAttribute; 2] = vertex_attr_array![0 => Float32x2, 1 => Float32x2];

    fn layout() -> VertexBufferLayout<'static> {
        VertexBufferLayout {
            array_stride: size_of::<Vertex>() as BufferAddress,
            step_mode: VertexStepMode::Vertex,
            attributes: &Self::ATTRIBUTES,
        }
    }
}

/// Triangle strip over the whole viewport; buffer row 0 maps to the top edge.
const QUAD: [Vertex; 4] = [
    Vertex { position: [-1.0, -1.0], tex_coords: [0.0, 1.0] },
    Vertex { position: [1.0, -1.0], tex_coords: [1.0, 1.0] },
    Vertex { position: [-1.0, 1.0], tex_coords: [0.0, 0.0] },
    Vertex { position: [1.0, 1.0], tex_coords: [1.0, 0.0] },
];

const IDENTITY: [[f32; 4]; 4] = [
    [1.0, 0.0, 0.0, 0.0],
    [0.0, 1.0, 0.0, 0.0],
    [0.0, 0.0, 1.0, 0.0],
    [0.0, 0.0, 0.0, 1.0],
];

const TARGET_FORMAT: TextureFormat = TextureFormat::Rgba8UnormSrgb;

struct FrameTexture {
    texture: Texture,
    bind_group: BindGroup,
    resolution: Resolution,
}

/// GPU renderer: one texture, one fixed quad, one orthographic (identity) transform.
pub struct GpuRenderer {
    device: Device,
    queue: Queue,
    pipeline: RenderPipeline,
    bind_group_layout: BindGroupLayout,
    sampler: Sampler,
    transform: Buffer,
    quad: Buffer,
    frame: Option<FrameTexture>,
    target_view: TextureView,
    viewport: Resolution,
}

impl GpuRenderer {
    /// Renderer without a window, drawing into an offscreen `viewport`-sized target.
    pub fn headless(viewport: Resolution) -> Result<Self, RenderError> {
        pollster::block_on(Self::new_headless(viewport))
    }

    #[instrument]
    pub async fn new_headless(viewport: Resolution) -> Result<Self, RenderError> {
        info!("Initializing WebGPU renderer");

        let instance = Instance::new(InstanceDescriptor {
            backends: Backends::all(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&RequestAdapterOptions {
                power_preference: PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or(RenderError::Adapter)?;

        info!("GPU: {}", adapter.get_info().name);

        let (device, queue) = adapter
            .request_device(
                &DeviceDescriptor {
                    label: Some("Iris GPU Device"),
                    required_features: Features::empty(),
                    required_limits: Limits::downlevel_defaults(),
                    memory_hints: Default::default(),
                },
                None,
            )
            .await
            .map_err(|e| RenderError::Device(e.to_string()))?;

        Self::with_device(device, queue, viewport).await
    }

    /// Build the fixed pipeline on an existing device. Validation errors are fatal.
    pub async fn with_device(
        device: Device,
        queue: Queue,
        viewport: Resolution,
    ) -> Result<Self, RenderError> {
        if viewport.area() == 0 {
            return Err(RenderError::Surface(format!("empty viewport {}", viewport)));
        }

        device.push_error_scope(ErrorFilter::Validation);
        let (pipeline, bind_group_layout) = Self::create_render_pipeline(&device, TARGET_FORMAT);
        if let Some(err) = device.pop_error_scope().await {
            return Err(RenderError::Shader(err.to_string()));
        }

        let sampler = device.create_sampler(&SamplerDescriptor {
            label: Some("Frame Sampler"),
            address_mode_u: AddressMode::ClampToEdge,
            address_mode_v: AddressMode::ClampToEdge,
            mag_filter: FilterMode::Linear,
            min_filter: FilterMode::Linear,
            ..Default::default()
        });

        let transform = device.create_buffer_init(&util::BufferInitDescriptor {
            label: Some("Transform"),
            contents: bytemuck::bytes_of(&IDENTITY),
            usage: BufferUsages::UNIFORM,
        });

        let quad = device.create_buffer_init(&util::BufferInitDescriptor {
            label: Some("Quad"),
            contents: bytemuck::cast_slice(&QUAD),
            usage: BufferUsages::VERTEX,
        });

        let target = device.create_texture(&TextureDescriptor {
            label: Some("Display Target"),
            size: Extent3d {
                width: viewport.width,
                height: viewport.height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: TextureDimension::D2,
            format: TARGET_FORMAT,
            usage: TextureUsages::RENDER_ATTACHMENT | TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let target_view = target.create_view(&TextureViewDescriptor::default());

        Ok(Self {
            device,
            queue,
            pipeline,
            bind_group_layout,
            sampler,
            transform,
            quad,
            frame: None,
            target_view,
            viewport,
        })
    }

    pub fn viewport(&self) -> Resolution {
        self.viewport
    }

    fn create_frame_texture(&self, resolution: Resolution) -> FrameTexture {
        let texture = self.device.create_texture(&TextureDescriptor {
            label: Some("Frame Texture"),
            size: Extent3d {
                width: resolution.width,
                height: resolution.height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: TextureDimension::D2,
            format: TextureFormat::Rgba8UnormSrgb,
            usage: TextureUsages::TEXTURE_BINDING | TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let view = texture.create_view(&TextureViewDescriptor::default());

        let bind_group = self.device.create_bind_group(&BindGroupDescriptor {
            label: Some("Frame Bind Group"),
            layout: &self.bind_group_layout,
            entries: &[
                BindGroupEntry {
                    binding: 0,
                    resource: self.transform.as_entire_binding(),
                },
                BindGroupEntry {
                    binding: 1,
                    resource: BindingResource::TextureView(&view),
                },
                BindGroupEntry {
                    binding: 2,
                    resource: BindingResource::Sampler(&self.sampler),
                },
            ],
        });

        FrameTexture {
            texture,
            bind_group,
            resolution,
        }
    }

    fn create_render_pipeline(
        device: &Device,
        format: TextureFormat,
    ) -> (RenderPipeline, BindGroupLayout) {
        let shader = device.create_shader_module(ShaderModuleDescriptor {
            label: Some("Display Shader"),
            source: ShaderSource::Wgsl(SHADER_SOURCE.into()),
        });

        let bind_group_layout = device.create_bind_group_layout(&BindGroupLayoutDescriptor {
            label: Some("Frame Bind Group Layout"),
            entries: &[
                BindGroupLayoutEntry {
                    binding: 0,
                    visibility: ShaderStages::VERTEX,
                    ty: BindingType::Buffer {
                        ty: BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                BindGroupLayoutEntry {
                    binding: 1,
                    visibility: ShaderStages::FRAGMENT,
                    ty: BindingType::Texture {
                        sample_type: TextureSampleType::Float { filterable: true },
                        view_dimension: TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                BindGroupLayoutEntry {
                    binding: 2,
                    visibility: ShaderStages::FRAGMENT,
                    ty: BindingType::Sampler(SamplerBindingType::Filtering),
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&PipelineLayoutDescriptor {
            label: Some("Display Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let pipeline = device.create_render_pipeline(&RenderPipelineDescriptor {
            label: Some("Display Pipeline"),
            layout: Some(&pipeline_layout),
            cache: None,
            vertex: VertexState {
                module: &shader,
                entry_point: Some("vs_main"),
                compilation_options: Default::default(),
                buffers: &[Vertex::layout()],
            },
            fragment: Some(FragmentState {
                module: &shader,
                entry_point: Some("fs_main"),
                compilation_options: Default::default(),
                targets: &[Some(ColorTargetState {
                    format,
                    blend: Some(BlendState::REPLACE),
                    write_mask: ColorWrites::ALL,
                })],
            }),
            primitive: PrimitiveState {
                topology: PrimitiveTopology::TriangleStrip,
                strip_index_format: None,
                front_face: FrontFace::Ccw,
                cull_mode: None,
                polygon_mode: PolygonMode::Fill,
                unclipped_depth: false,
                conservative: false,
            },
            depth_stencil: None,
            multisample: MultisampleState::default(),
            multiview: None,
        });

        (pipeline, bind_group_layout)
    }
}

impl FrameRenderer for GpuRenderer {
    fn upload(&mut self, frame: &ProcessedFrame) -> Result<(), RenderError> {
        let resolution = frame.resolution;
        if resolution.area() == 0 || frame.rgba.len() != resolution.rgba_len() {
            return Err(RenderError::Upload(format!(
                "{} bytes for a {} frame",
                frame.rgba.len(),
                resolution
            )));
        }

        if self.frame.as_ref().map(|f| f.resolution) != Some(resolution) {
            self.frame = Some(self.create_frame_texture(resolution));
        }
        let Some(target) = self.frame.as_ref() else {
            return Err(RenderError::Upload("texture missing".into()));
        };

        self.queue.write_texture(
            ImageCopyTexture {
                texture: &target.texture,
                mip_level: 0,
                origin: Origin3d::ZERO,
                aspect: TextureAspect::All,
            },
            &frame.rgba,
            ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(4 * resolution.width),
                rows_per_image: Some(resolution.height),
            },
            Extent3d {
                width: resolution.width,
                height: resolution.height,
                depth_or_array_layers: 1,
            },
        );

        Ok(())
    }

    fn draw(&mut self) -> Result<(), RenderError> {
        let Some(frame) = self.frame.as_ref() else {
            return Err(RenderError::Surface("draw before first upload".into()));
        };

        let mut encoder = self
            .device
            .create_command_encoder(&CommandEncoderDescriptor {
                label: Some("Render Encoder"),
            });

        {
            let mut render_pass = encoder.begin_render_pass(&RenderPassDescriptor {
                label: Some("Render Pass"),
                color_attachments: &[Some(RenderPassColorAttachment {
                    view: &self.target_view,
                    resolve_target: None,
                    ops: Operations {
                        load: LoadOp::Clear(Color::BLACK),
                        store: StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                occlusion_query_set: None,
                timestamp_writes: None,
            });

            render_pass.set_pipeline(&self.pipeline);
            render_pass.set_bind_group(0, &frame.bind_group, &[]);
            render_pass.set_vertex_buffer(0, self.quad.slice(..));
            render_pass.draw(0..QUAD.len() as u32, 0..1);
        }

        self.queue.submit(std::iter::once(encoder.finish()));
        Ok(())
    }
}
