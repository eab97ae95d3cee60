//! wgpu implementation of the render seams: R32Float band planes, the
//! RGBA8 colormap LUT, and the raster draw pass.

use std::sync::{Arc, Mutex};

use bytemuck::{Pod, Zeroable};

use crate::error::{EngineError, EngineResult};
use crate::gpu::{
    ColormapTexture, DrawMode, DrawPass, FrameUniforms, RenderContext, TexturePlane, TileProps,
};

pub fn padded_bytes_per_row(unpadded: u32) -> u32 {
    let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
    unpadded.div_ceil(align) * align
}

fn copy_rows_with_padding(src: &[u8], row_bytes: usize, padded: usize, rows: usize) -> Vec<u8> {
    let mut out = vec![0u8; padded * rows];
    for row in 0..rows {
        out[row * padded..row * padded + row_bytes]
            .copy_from_slice(&src[row * row_bytes..(row + 1) * row_bytes]);
    }
    out
}

/// Shared device/queue handle.
#[derive(Clone)]
pub struct WgpuContext {
    pub device: Arc<wgpu::Device>,
    pub queue: Arc<wgpu::Queue>,
}

impl WgpuContext {
    pub fn new(device: Arc<wgpu::Device>, queue: Arc<wgpu::Queue>) -> Self {
        Self { device, queue }
    }

    /// Stand up a headless context on the first available adapter.
    pub fn headless() -> EngineResult<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .ok_or_else(|| EngineError::transport("no suitable GPU adapter"))?;

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::downlevel_defaults(),
                label: Some("zarrmap-device"),
            },
            None,
        ))
        .map_err(|e| EngineError::transport(format!("request_device failed: {e}")))?;

        Ok(Self::new(Arc::new(device), Arc::new(queue)))
    }
}

struct BandPlane {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    size: u32,
    queue: Arc<wgpu::Queue>,
}

impl std::fmt::Debug for BandPlane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BandPlane").field("size", &self.size).finish()
    }
}

impl TexturePlane for BandPlane {
    fn write(&self, data: &[f32]) {
        let expected = (self.size * self.size) as usize;
        if data.len() != expected {
            log::warn!(
                "band plane write skipped: got {} texels, expected {expected}",
                data.len()
            );
            return;
        }
        let unpadded = 4 * self.size;
        let padded = padded_bytes_per_row(unpadded);
        let src = bytemuck::cast_slice(data);
        let bytes = if padded != unpadded {
            std::borrow::Cow::Owned(copy_rows_with_padding(
                src,
                unpadded as usize,
                padded as usize,
                self.size as usize,
            ))
        } else {
            std::borrow::Cow::Borrowed(src)
        };
        self.queue.write_texture(
            wgpu::ImageCopyTexture {
                texture: &self.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            &bytes,
            wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(padded),
                rows_per_image: Some(self.size),
            },
            wgpu::Extent3d {
                width: self.size,
                height: self.size,
                depth_or_array_layers: 1,
            },
        );
    }

    fn size(&self) -> u32 {
        self.size
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

struct ColormapLut {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    width: u32,
    queue: Arc<wgpu::Queue>,
}

impl std::fmt::Debug for ColormapLut {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ColormapLut").field("width", &self.width).finish()
    }
}

impl ColormapTexture for ColormapLut {
    fn write(&self, rgba: &[[u8; 4]]) {
        if rgba.len() != self.width as usize {
            log::warn!(
                "colormap write skipped: got {} entries, expected {}",
                rgba.len(),
                self.width
            );
            return;
        }
        self.queue.write_texture(
            wgpu::ImageCopyTexture {
                texture: &self.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            bytemuck::cast_slice(rgba),
            wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(4 * self.width),
                rows_per_image: Some(1),
            },
            wgpu::Extent3d {
                width: self.width,
                height: 1,
                depth_or_array_layers: 1,
            },
        );
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

impl RenderContext for WgpuContext {
    fn create_band_plane(&self, label: &str, size: u32) -> Arc<dyn TexturePlane> {
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: wgpu::Extent3d {
                width: size,
                height: size,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::R32Float,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        Arc::new(BandPlane {
            texture,
            view,
            size,
            queue: Arc::clone(&self.queue),
        })
    }

    fn create_colormap(&self, rgba: &[[u8; 4]]) -> Arc<dyn ColormapTexture> {
        let width = rgba.len().max(1) as u32;
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("zarrmap-colormap"),
            size: wgpu::Extent3d {
                width,
                height: 1,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8UnormSrgb,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let lut = ColormapLut {
            texture,
            view,
            width,
            queue: Arc::clone(&self.queue),
        };
        lut.write(rgba);
        Arc::new(lut)
    }
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct TileUniforms {
    custom0: [f32; 4],
    custom1: [f32; 4],
    camera: [f32; 2],
    offset: [f32; 2],
    order: [f32; 2],
    clim: [f32; 2],
    viewport: [f32; 2],
    pixel_ratio: f32,
    zoom: f32,
    size: f32,
    global_level: f32,
    level: f32,
    projection: f32,
    opacity: f32,
    fill_value: f32,
    center_y: f32,
    mode: f32,
    band_count: f32,
    _pad: [f32; 3],
}

const UNIFORM_STRIDE: u64 = 256; // dynamic-offset alignment

/// Band texture bindings available to the shader per draw.
pub const MAX_BANDS: usize = 4;

/// The raster draw pass: one pipeline per engine, one draw per prop.
pub struct RasterPass {
    ctx: WgpuContext,
    pipeline: wgpu::RenderPipeline,
    frame_layout: wgpu::BindGroupLayout,
    band_layout: wgpu::BindGroupLayout,
    sampler: wgpu::Sampler,
    uniform_buffer: Mutex<wgpu::Buffer>,
    target: Mutex<Option<wgpu::TextureView>>,
    mode: DrawMode,
    /// Names of the custom uniforms, in packing order (8 slots).
    custom_names: Vec<String>,
    /// Fills band slots past a prop's band count.
    _dummy_band: wgpu::Texture,
    dummy_band_view: wgpu::TextureView,
}

impl RasterPass {
    pub fn new(
        ctx: WgpuContext,
        format: wgpu::TextureFormat,
        mode: DrawMode,
        frag_snippet: Option<&str>,
        custom_names: Vec<String>,
    ) -> EngineResult<Self> {
        let mut source = include_str!("shaders/raster.wgsl").to_string();
        if let Some(snippet) = frag_snippet {
            source = source.replace("//FRAG_SNIPPET", snippet);
        }
        let shader = ctx
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("zarrmap-raster-shader"),
                source: wgpu::ShaderSource::Wgsl(source.into()),
            });

        let frame_layout = ctx
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("zarrmap-frame-bgl"),
                entries: &[
                    wgpu::BindGroupLayoutEntry {
                        binding: 0,
                        visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                        ty: wgpu::BindingType::Buffer {
                            ty: wgpu::BufferBindingType::Uniform,
                            has_dynamic_offset: true,
                            min_binding_size: wgpu::BufferSize::new(
                                std::mem::size_of::<TileUniforms>() as u64,
                            ),
                        },
                        count: None,
                    },
                    wgpu::BindGroupLayoutEntry {
                        binding: 1,
                        visibility: wgpu::ShaderStages::FRAGMENT,
                        ty: wgpu::BindingType::Texture {
                            sample_type: wgpu::TextureSampleType::Float { filterable: true },
                            view_dimension: wgpu::TextureViewDimension::D2,
                            multisampled: false,
                        },
                        count: None,
                    },
                    wgpu::BindGroupLayoutEntry {
                        binding: 2,
                        visibility: wgpu::ShaderStages::FRAGMENT,
                        ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                        count: None,
                    },
                ],
            });

        let mut band_entries: Vec<wgpu::BindGroupLayoutEntry> = (0..MAX_BANDS as u32)
            .map(|binding| wgpu::BindGroupLayoutEntry {
                binding,
                visibility: wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Texture {
                    sample_type: wgpu::TextureSampleType::Float { filterable: false },
                    view_dimension: wgpu::TextureViewDimension::D2,
                    multisampled: false,
                },
                count: None,
            })
            .collect();
        band_entries.push(wgpu::BindGroupLayoutEntry {
            binding: MAX_BANDS as u32,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::NonFiltering),
            count: None,
        });
        let band_layout = ctx
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("zarrmap-band-bgl"),
                entries: &band_entries,
            });

        let layout = ctx
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("zarrmap-raster-layout"),
                bind_group_layouts: &[&frame_layout, &band_layout],
                push_constant_ranges: &[],
            });

        let topology = match mode {
            DrawMode::Texture => wgpu::PrimitiveTopology::TriangleList,
            DrawMode::Grid | DrawMode::DotGrid => wgpu::PrimitiveTopology::PointList,
        };

        let pipeline = ctx
            .device
            .create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some("zarrmap-raster-pipeline"),
                layout: Some(&layout),
                vertex: wgpu::VertexState {
                    module: &shader,
                    entry_point: "vs_main",
                    buffers: &[],
                },
                fragment: Some(wgpu::FragmentState {
                    module: &shader,
                    entry_point: "fs_main",
                    targets: &[Some(wgpu::ColorTargetState {
                        format,
                        blend: Some(wgpu::BlendState::ALPHA_BLENDING),
                        write_mask: wgpu::ColorWrites::ALL,
                    })],
                }),
                primitive: wgpu::PrimitiveState {
                    topology,
                    ..Default::default()
                },
                depth_stencil: None,
                multisample: wgpu::MultisampleState::default(),
                multiview: None,
            });

        let sampler = ctx.device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("zarrmap-sampler"),
            mag_filter: wgpu::FilterMode::Nearest,
            min_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });

        let uniform_buffer = ctx.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("zarrmap-uniforms"),
            size: UNIFORM_STRIDE * 64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let dummy_band = ctx.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("zarrmap-dummy-band"),
            size: wgpu::Extent3d {
                width: 1,
                height: 1,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::R32Float,
            usage: wgpu::TextureUsages::TEXTURE_BINDING,
            view_formats: &[],
        });
        let dummy_band_view = dummy_band.create_view(&wgpu::TextureViewDescriptor::default());

        Ok(Self {
            ctx,
            pipeline,
            frame_layout,
            band_layout,
            sampler,
            uniform_buffer: Mutex::new(uniform_buffer),
            target: Mutex::new(None),
            mode,
            custom_names,
            _dummy_band: dummy_band,
            dummy_band_view,
        })
    }

    /// Point the pass at the frame's render target.
    pub fn set_target(&self, view: wgpu::TextureView) {
        *self.target.lock().unwrap() = Some(view);
    }

    fn pack_uniforms(&self, prop: &TileProps, uniforms: &FrameUniforms) -> TileUniforms {
        let mut custom = [0f32; 8];
        for (slot, name) in self.custom_names.iter().take(8).enumerate() {
            if let Some(v) = uniforms.custom.get(name) {
                custom[slot] = *v;
            }
        }
        TileUniforms {
            custom0: [custom[0], custom[1], custom[2], custom[3]],
            custom1: [custom[4], custom[5], custom[6], custom[7]],
            camera: [uniforms.camera[0] as f32, uniforms.camera[1] as f32],
            offset: [prop.offset[0] as f32, prop.offset[1] as f32],
            order: [uniforms.order[0] as f32, uniforms.order[1] as f32],
            clim: uniforms.clim,
            viewport: [uniforms.viewport_width as f32, uniforms.viewport_height as f32],
            pixel_ratio: uniforms.pixel_ratio as f32,
            zoom: uniforms.zoom as f32,
            size: uniforms.size as f32,
            global_level: uniforms.global_level as f32,
            level: prop.level as f32,
            projection: uniforms.projection_code as f32,
            opacity: uniforms.opacity,
            fill_value: uniforms.fill_value,
            center_y: uniforms.center_y as f32,
            mode: match self.mode {
                DrawMode::Texture => 0.0,
                DrawMode::Grid => 1.0,
                DrawMode::DotGrid => 2.0,
            },
            band_count: prop.bands.len().min(MAX_BANDS) as f32,
            _pad: [0.0; 3],
        }
    }
}

impl DrawPass for RasterPass {
    fn draw(
        &self,
        props: &[TileProps],
        _colormap: &Arc<dyn ColormapTexture>,
        uniforms: &FrameUniforms,
    ) -> EngineResult<()> {
        let target = self.target.lock().unwrap();
        let Some(view) = target.as_ref() else {
            log::warn!("raster pass has no render target, skipping frame");
            return Ok(());
        };

        // Grow the dynamic uniform buffer to the frame's prop count.
        {
            let mut buffer = self.uniform_buffer.lock().unwrap();
            let needed = UNIFORM_STRIDE * props.len().max(1) as u64;
            if buffer.size() < needed {
                *buffer = self.ctx.device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some("zarrmap-uniforms"),
                    size: needed.next_power_of_two(),
                    usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                    mapped_at_creation: false,
                });
            }
            for (i, prop) in props.iter().enumerate() {
                let packed = self.pack_uniforms(prop, uniforms);
                self.ctx.queue.write_buffer(
                    &buffer,
                    UNIFORM_STRIDE * i as u64,
                    bytemuck::bytes_of(&packed),
                );
            }
        }

        // The engine always hands us the LUT we created.
        let colormap_view = _colormap
            .as_any()
            .downcast_ref::<ColormapLut>()
            .map(|lut| &lut.view)
            .ok_or_else(|| EngineError::transport("colormap is not a wgpu texture"))?;

        let buffer = self.uniform_buffer.lock().unwrap();
        let mut encoder = self
            .ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("zarrmap-raster-encoder"),
            });

        // Bind groups must outlive the render pass (wgpu::RenderPass has a
        // Drop impl, so dropck requires borrowed data to live until the pass
        // itself is dropped, not just until its last use). Build them all
        // up front and hold them in this Vec for the pass's lifetime.
        let mut bind_groups: Vec<(usize, wgpu::BindGroup, wgpu::BindGroup)> = Vec::new();

        for (i, prop) in props.iter().enumerate() {
            if prop.bands.is_empty() {
                continue;
                }
                // Every band gets a binding slot; slots past the prop's
                // band count fall back to the dummy plane.
                let band_views: Vec<&wgpu::TextureView> = (0..MAX_BANDS)
                    .map(|slot| {
                        prop.bands
                            .get(slot)
                            .and_then(|(_, band)| band.as_any().downcast_ref::<BandPlane>())
                            .map(|b| &b.view)
                            .unwrap_or(&self.dummy_band_view)
                    })
                    .collect();
                if prop.bands.len() > MAX_BANDS {
                    log::warn!(
                        "tile {} carries {} bands, shader binds only {MAX_BANDS}",
                        prop.key,
                        prop.bands.len()
                    );
                }
                let frame_group = self.ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some("zarrmap-frame-bg"),
                    layout: &self.frame_layout,
                    entries: &[
                        wgpu::BindGroupEntry {
                            binding: 0,
                            resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                                buffer: &buffer,
                                offset: 0,
                                size: wgpu::BufferSize::new(
                                    std::mem::size_of::<TileUniforms>() as u64
                                ),
                            }),
                        },
                        wgpu::BindGroupEntry {
                            binding: 1,
                            resource: wgpu::BindingResource::TextureView(colormap_view),
                        },
                        wgpu::BindGroupEntry {
                            binding: 2,
                            resource: wgpu::BindingResource::Sampler(&self.sampler),
                        },
                    ],
                });
                let mut band_entries: Vec<wgpu::BindGroupEntry> = band_views
                    .iter()
                    .enumerate()
                    .map(|(slot, view)| wgpu::BindGroupEntry {
                        binding: slot as u32,
                        resource: wgpu::BindingResource::TextureView(view),
                    })
                    .collect();
                band_entries.push(wgpu::BindGroupEntry {
                    binding: MAX_BANDS as u32,
                    resource: wgpu::BindingResource::Sampler(&self.sampler),
                });
                let band_group = self.ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some("zarrmap-band-bg"),
                    layout: &self.band_layout,
                    entries: &band_entries,
                });
            bind_groups.push((i, frame_group, band_group));
        }

        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("zarrmap-raster-pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Load,
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            pass.set_pipeline(&self.pipeline);

            let vertex_count = match self.mode {
                DrawMode::Texture => 6,
                DrawMode::Grid | DrawMode::DotGrid => uniforms.size * uniforms.size,
            };

            for (i, frame_group, band_group) in &bind_groups {
                pass.set_bind_group(0, frame_group, &[(UNIFORM_STRIDE * *i as u64) as u32]);
                pass.set_bind_group(1, band_group, &[]);
                pass.draw(0..vertex_count, 0..1);
            }
        }
        self.ctx.queue.submit(Some(encoder.finish()));
        Ok(())
    }
}
