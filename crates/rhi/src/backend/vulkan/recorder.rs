//! Replays recorded [`Command`]s into a Vulkan command buffer.
//!
//! Render targets bound with `SetRenderTargets` open a dynamic rendering
//! scope lazily at the first draw; any command that must run outside one
//! (barriers, copies, dispatches, clears, rebinding) closes it first.
//! Clears are zero-draw rendering scopes with a clear load op, so targets
//! stay in their attachment layouts.

use ash::vk;

use super::convert;
use super::descriptors::AttachmentView;
use super::{Objects, Resource};
use crate::command::{BindPoint, Command, IndexFormat};
use crate::descriptor::DescriptorHeapType;
use crate::error::{RhiError, RhiResult};
use crate::pipeline::RootSignatureDesc;
use crate::types::{ResourceState, ScissorRect, Viewport};

/// Image whose first use must start from an undefined layout.
#[derive(Debug, Clone, Copy)]
pub struct PendingLayout {
    pub image: vk::Image,
    pub range: vk::ImageSubresourceRange,
    pub layout: vk::ImageLayout,
}

/// Moves freshly created images into the layout of their initial state.
pub fn initialize_layouts(device: &ash::Device, cb: vk::CommandBuffer, pending: &[PendingLayout]) {
    if pending.is_empty() {
        return;
    }
    let barriers: Vec<vk::ImageMemoryBarrier2> = pending
        .iter()
        .map(|p| {
            vk::ImageMemoryBarrier2::default()
                .src_stage_mask(vk::PipelineStageFlags2::TOP_OF_PIPE)
                .src_access_mask(vk::AccessFlags2::NONE)
                .dst_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
                .dst_access_mask(vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE)
                .old_layout(vk::ImageLayout::UNDEFINED)
                .new_layout(p.layout)
                .image(p.image)
                .subresource_range(p.range)
        })
        .collect();
    let dependency = vk::DependencyInfo::default().image_memory_barriers(&barriers);
    unsafe { device.cmd_pipeline_barrier2(cb, &dependency) };
}

struct BoundLayout<'a> {
    layout: vk::PipelineLayout,
    desc: &'a RootSignatureDesc,
}

pub struct Recorder<'a> {
    device: &'a ash::Device,
    objects: &'a Objects,
    cb: vk::CommandBuffer,
    rendering: bool,
    color: Vec<AttachmentView>,
    depth: Option<AttachmentView>,
    graphics: Option<BoundLayout<'a>>,
    compute: Option<BoundLayout<'a>>,
    sets: Vec<vk::DescriptorSet>,
}

impl<'a> Recorder<'a> {
    pub fn new(device: &'a ash::Device, objects: &'a Objects, cb: vk::CommandBuffer) -> Self {
        Self {
            device,
            objects,
            cb,
            rendering: false,
            color: Vec::new(),
            depth: None,
            graphics: None,
            compute: None,
            sets: Vec::new(),
        }
    }

    pub fn record(mut self, commands: &[Command]) -> RhiResult<()> {
        for command in commands {
            self.command(command)?;
        }
        self.end_rendering();
        Ok(())
    }

    fn command(&mut self, command: &Command) -> RhiResult<()> {
        let device = self.device;
        let cb = self.cb;

        match command {
            Command::ResourceBarrier(barriers) => {
                self.end_rendering();
                let mut images = Vec::new();
                let mut memory = Vec::new();
                for b in barriers {
                    let src = convert::state_sync(b.before);
                    let dst = convert::state_sync(b.after);
                    match self.objects.resource(b.resource)? {
                        Resource::Texture(image) => images.push(
                            vk::ImageMemoryBarrier2::default()
                                .src_stage_mask(src.stage)
                                .src_access_mask(src.access)
                                .dst_stage_mask(dst.stage)
                                .dst_access_mask(dst.access)
                                .old_layout(src.layout)
                                .new_layout(dst.layout)
                                .image(image.image)
                                .subresource_range(image.full_range()),
                        ),
                        Resource::Buffer { .. } => memory.push(
                            vk::MemoryBarrier2::default()
                                .src_stage_mask(src.stage)
                                .src_access_mask(src.access)
                                .dst_stage_mask(dst.stage)
                                .dst_access_mask(dst.access),
                        ),
                    }
                }
                let dependency = vk::DependencyInfo::default()
                    .memory_barriers(&memory)
                    .image_memory_barriers(&images);
                unsafe { device.cmd_pipeline_barrier2(cb, &dependency) };
            }
            Command::ClearRenderTarget { rtv, color } => {
                self.end_rendering();
                let target = self.objects.attachment(DescriptorHeapType::Rtv, *rtv)?;
                let attachment = vk::RenderingAttachmentInfo::default()
                    .image_view(target.view)
                    .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                    .load_op(vk::AttachmentLoadOp::CLEAR)
                    .store_op(vk::AttachmentStoreOp::STORE)
                    .clear_value(vk::ClearValue {
                        color: vk::ClearColorValue { float32: *color },
                    });
                let info = vk::RenderingInfo::default()
                    .render_area(full_area(target.extent))
                    .layer_count(1)
                    .color_attachments(std::slice::from_ref(&attachment));
                unsafe {
                    device.cmd_begin_rendering(cb, &info);
                    device.cmd_end_rendering(cb);
                }
            }
            Command::ClearDepthStencil { dsv, depth } => {
                self.end_rendering();
                let target = self.objects.attachment(DescriptorHeapType::Dsv, *dsv)?;
                let attachment = vk::RenderingAttachmentInfo::default()
                    .image_view(target.view)
                    .image_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                    .load_op(vk::AttachmentLoadOp::CLEAR)
                    .store_op(vk::AttachmentStoreOp::STORE)
                    .clear_value(vk::ClearValue {
                        depth_stencil: vk::ClearDepthStencilValue {
                            depth: *depth,
                            stencil: 0,
                        },
                    });
                let info = vk::RenderingInfo::default()
                    .render_area(full_area(target.extent))
                    .layer_count(1)
                    .depth_attachment(&attachment);
                unsafe {
                    device.cmd_begin_rendering(cb, &info);
                    device.cmd_end_rendering(cb);
                }
            }
            Command::SetViewport(viewport) => unsafe {
                device.cmd_set_viewport(cb, 0, &[flipped_viewport(viewport)]);
            },
            Command::SetScissor(rect) => unsafe {
                device.cmd_set_scissor(cb, 0, &[scissor(rect)]);
            },
            Command::SetRenderTargets { color, depth } => {
                self.end_rendering();
                self.color = color
                    .iter()
                    .map(|&rtv| self.objects.attachment(DescriptorHeapType::Rtv, rtv))
                    .collect::<RhiResult<_>>()?;
                self.depth = depth
                    .map(|dsv| self.objects.attachment(DescriptorHeapType::Dsv, dsv))
                    .transpose()?;
            }
            Command::SetPipelineState(id) => {
                let pipeline = self.objects.pipeline(*id)?;
                unsafe { device.cmd_bind_pipeline(cb, pipeline.bind_point, pipeline.pipeline) };
            }
            Command::SetRootSignature {
                bind_point,
                root_signature,
            } => {
                let root = self.objects.root_signature(*root_signature)?;
                let bound = BoundLayout {
                    layout: root.layout,
                    desc: &root.desc,
                };
                match bind_point {
                    BindPoint::Graphics => self.graphics = Some(bound),
                    BindPoint::Compute => self.compute = Some(bound),
                }
                self.bind_sets(*bind_point);
            }
            Command::SetDescriptorHeaps(heaps) => {
                let mut shader = None;
                let mut sampler = None;
                for &id in heaps {
                    let heap = self.objects.heap(id)?;
                    match heap.heap_type() {
                        DescriptorHeapType::CbvSrvUav => shader = heap.descriptor_set(),
                        DescriptorHeapType::Sampler => sampler = heap.descriptor_set(),
                        other => {
                            return Err(RhiError::Validation(format!(
                                "{other:?} heaps are not shader visible"
                            )));
                        }
                    }
                }
                self.sets = shader.into_iter().chain(sampler).collect();
                self.bind_sets(BindPoint::Graphics);
                self.bind_sets(BindPoint::Compute);
            }
            Command::SetRootDescriptorTable {
                bind_point,
                parameter,
                base_index,
            } => self.push_constants(*bind_point, *parameter, 0, &[*base_index])?,
            Command::SetRoot32BitConstants {
                bind_point,
                parameter,
                offset,
                values,
            } => self.push_constants(*bind_point, *parameter, *offset, values)?,
            Command::SetPrimitiveTopology(topology) => unsafe {
                device.cmd_set_primitive_topology(cb, convert::topology(*topology));
            },
            Command::SetVertexBuffers { start_slot, views } => {
                let buffers = views
                    .iter()
                    .map(|v| self.objects.buffer(v.resource))
                    .collect::<RhiResult<Vec<_>>>()?;
                let offsets: Vec<u64> = views.iter().map(|v| v.offset).collect();
                unsafe { device.cmd_bind_vertex_buffers(cb, *start_slot, &buffers, &offsets) };
            }
            Command::SetIndexBuffer(view) => {
                let buffer = self.objects.buffer(view.resource)?;
                let index_type = match view.format {
                    IndexFormat::U16 => vk::IndexType::UINT16,
                    IndexFormat::U32 => vk::IndexType::UINT32,
                };
                unsafe { device.cmd_bind_index_buffer(cb, buffer, view.offset, index_type) };
            }
            Command::DrawInstanced {
                vertex_count,
                instance_count,
                start_vertex,
                start_instance,
            } => {
                self.begin_rendering()?;
                unsafe {
                    device.cmd_draw(cb, *vertex_count, *instance_count, *start_vertex, *start_instance);
                }
            }
            Command::DrawIndexedInstanced {
                index_count,
                instance_count,
                start_index,
                base_vertex,
                start_instance,
            } => {
                self.begin_rendering()?;
                unsafe {
                    device.cmd_draw_indexed(
                        cb,
                        *index_count,
                        *instance_count,
                        *start_index,
                        *base_vertex,
                        *start_instance,
                    );
                }
            }
            Command::Dispatch { x, y, z } => {
                self.end_rendering();
                unsafe { device.cmd_dispatch(cb, *x, *y, *z) };
            }
            Command::CopyBufferRegion {
                dst,
                dst_offset,
                src,
                src_offset,
                size,
            } => {
                self.end_rendering();
                let region = vk::BufferCopy {
                    src_offset: *src_offset,
                    dst_offset: *dst_offset,
                    size: *size,
                };
                let (src, dst) = (self.objects.buffer(*src)?, self.objects.buffer(*dst)?);
                unsafe { device.cmd_copy_buffer(cb, src, dst, &[region]) };
            }
            Command::CopyBufferToTexture {
                src,
                src_offset,
                dst,
                mip,
                layer,
            } => {
                self.end_rendering();
                let src = self.objects.buffer(*src)?;
                let Resource::Texture(image) = self.objects.resource(*dst)? else {
                    return Err(RhiError::Validation("copy destination is not a texture".into()));
                };
                let (width, height) = image.desc.mip_extent(*mip);
                let region = vk::BufferImageCopy::default()
                    .buffer_offset(*src_offset)
                    .image_subresource(vk::ImageSubresourceLayers {
                        aspect_mask: convert::aspect(image.desc.format),
                        mip_level: *mip,
                        base_array_layer: *layer,
                        layer_count: 1,
                    })
                    .image_extent(vk::Extent3D {
                        width,
                        height,
                        depth: 1,
                    });
                let layout = convert::state_sync(ResourceState::CopyDest).layout;
                unsafe { device.cmd_copy_buffer_to_image(cb, src, image.image, layout, &[region]) };
            }
        }
        Ok(())
    }

    fn begin_rendering(&mut self) -> RhiResult<()> {
        if self.rendering {
            return Ok(());
        }
        let Some(first) = self.color.first() else {
            return Err(RhiError::Validation("draw without a render target".to_string()));
        };

        let colors: Vec<vk::RenderingAttachmentInfo> = self
            .color
            .iter()
            .map(|target| {
                vk::RenderingAttachmentInfo::default()
                    .image_view(target.view)
                    .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                    .load_op(vk::AttachmentLoadOp::LOAD)
                    .store_op(vk::AttachmentStoreOp::STORE)
            })
            .collect();
        let depth = self.depth.map(|target| {
            vk::RenderingAttachmentInfo::default()
                .image_view(target.view)
                .image_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                .load_op(vk::AttachmentLoadOp::LOAD)
                .store_op(vk::AttachmentStoreOp::STORE)
        });

        let mut info = vk::RenderingInfo::default()
            .render_area(full_area(first.extent))
            .layer_count(1)
            .color_attachments(&colors);
        if let Some(depth) = depth.as_ref() {
            info = info.depth_attachment(depth);
        }
        unsafe { self.device.cmd_begin_rendering(self.cb, &info) };
        self.rendering = true;
        Ok(())
    }

    fn end_rendering(&mut self) {
        if self.rendering {
            unsafe { self.device.cmd_end_rendering(self.cb) };
            self.rendering = false;
        }
    }

    fn bound(&self, bind_point: BindPoint) -> Option<&BoundLayout<'a>> {
        match bind_point {
            BindPoint::Graphics => self.graphics.as_ref(),
            BindPoint::Compute => self.compute.as_ref(),
        }
    }

    fn bind_sets(&self, bind_point: BindPoint) {
        let Some(bound) = self.bound(bind_point) else {
            return;
        };
        if self.sets.is_empty() {
            return;
        }
        let vk_bind_point = match bind_point {
            BindPoint::Graphics => vk::PipelineBindPoint::GRAPHICS,
            BindPoint::Compute => vk::PipelineBindPoint::COMPUTE,
        };
        unsafe {
            self.device
                .cmd_bind_descriptor_sets(self.cb, vk_bind_point, bound.layout, 0, &self.sets, &[]);
        }
    }

    fn push_constants(
        &self,
        bind_point: BindPoint,
        parameter: u32,
        offset: u32,
        values: &[u32],
    ) -> RhiResult<()> {
        let Some(bound) = self.bound(bind_point) else {
            return Err(RhiError::Validation(
                "root constants set without a root signature".to_string(),
            ));
        };
        let Some(base) = bound.desc.dword_offset(parameter) else {
            return Err(RhiError::Validation(format!(
                "root parameter {parameter} does not exist"
            )));
        };
        unsafe {
            self.device.cmd_push_constants(
                self.cb,
                bound.layout,
                vk::ShaderStageFlags::ALL,
                (base + offset) * 4,
                bytemuck::cast_slice(values),
            );
        }
        Ok(())
    }
}

fn full_area(extent: vk::Extent2D) -> vk::Rect2D {
    vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent,
    }
}

/// Flips y so that clip space matches the y-down convention of the engine.
fn flipped_viewport(viewport: &Viewport) -> vk::Viewport {
    vk::Viewport {
        x: viewport.x,
        y: viewport.y + viewport.height,
        width: viewport.width,
        height: -viewport.height,
        min_depth: viewport.min_depth,
        max_depth: viewport.max_depth,
    }
}

fn scissor(rect: &ScissorRect) -> vk::Rect2D {
    vk::Rect2D {
        offset: vk::Offset2D {
            x: rect.left,
            y: rect.top,
        },
        extent: vk::Extent2D {
            width: (rect.right - rect.left).max(0) as u32,
            height: (rect.bottom - rect.top).max(0) as u32,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_viewport_is_flipped() {
        let vp = flipped_viewport(&Viewport::from_size(800, 600));
        assert_eq!(vp.y, 600.0);
        assert_eq!(vp.height, -600.0);
        assert_eq!(vp.width, 800.0);
    }

    #[test]
    fn test_scissor_extent() {
        let rect = scissor(&ScissorRect::from_size(320, 200));
        assert_eq!(rect.extent.width, 320);
        assert_eq!(rect.extent.height, 200);
        assert_eq!(rect.offset.x, 0);
    }
}
