//! Descriptor heaps on Vulkan.
//!
//! - The CBV/SRV/UAV heap is one update-after-bind descriptor set with
//!   three arrays: uniform buffers, sampled images and storage images. A
//!   heap index maps to an array element through the heap layout ranges.
//! - The sampler heap is a second set holding a sampler array.
//! - RTV and DSV heaps never reach the GPU. They are host tables of image
//!   views consumed when dynamic rendering begins.

use ash::vk;
use tracing::debug;

use super::convert;
use crate::descriptor::{DescriptorCategory, DescriptorHeapType, HeapLayout, ViewDesc, ViewDimension};
use crate::error::{RhiError, RhiResult};
use crate::types::{ResourceId, SamplerDesc, TextureDesc};

const CONSTANT_BINDING: u32 = 0;
const TEXTURE_BINDING: u32 = 1;
const MIP_BINDING: u32 = 2;
const SAMPLER_BINDING: u32 = 0;

/// Image view recorded in an RTV or DSV slot.
#[derive(Debug, Clone, Copy)]
pub struct AttachmentView {
    pub resource: ResourceId,
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub extent: vk::Extent2D,
}

/// Shader-visible slot contents.
#[derive(Debug, Clone, Copy)]
pub struct ShaderSlot {
    resource: Option<ResourceId>,
    view: Option<vk::ImageView>,
}

pub enum Heap {
    Shader {
        layout: HeapLayout,
        set_layout: vk::DescriptorSetLayout,
        pool: vk::DescriptorPool,
        set: vk::DescriptorSet,
        slots: Vec<Option<ShaderSlot>>,
    },
    Sampler {
        set_layout: vk::DescriptorSetLayout,
        pool: vk::DescriptorPool,
        set: vk::DescriptorSet,
        samplers: Vec<Option<vk::Sampler>>,
    },
    Attachment {
        heap_type: DescriptorHeapType,
        slots: Vec<Option<AttachmentView>>,
    },
}

impl Heap {
    pub fn new(device: &ash::Device, heap_type: DescriptorHeapType, layout: HeapLayout) -> RhiResult<Self> {
        match heap_type {
            DescriptorHeapType::CbvSrvUav => {
                let counts = [
                    (vk::DescriptorType::UNIFORM_BUFFER, layout.constant_buffers),
                    (vk::DescriptorType::SAMPLED_IMAGE, layout.textures),
                    (vk::DescriptorType::STORAGE_IMAGE, layout.mips),
                ];
                let (set_layout, pool, set) = create_set(device, &counts)?;
                debug!(
                    "Bindless set: {} uniform buffers, {} sampled images, {} storage images",
                    layout.constant_buffers, layout.textures, layout.mips
                );
                Ok(Self::Shader {
                    layout,
                    set_layout,
                    pool,
                    set,
                    slots: vec![None; layout.heap_capacity(heap_type) as usize],
                })
            }
            DescriptorHeapType::Sampler => {
                let counts = [(vk::DescriptorType::SAMPLER, layout.samplers)];
                let (set_layout, pool, set) = create_set(device, &counts)?;
                Ok(Self::Sampler {
                    set_layout,
                    pool,
                    set,
                    samplers: vec![None; layout.samplers as usize],
                })
            }
            DescriptorHeapType::Rtv | DescriptorHeapType::Dsv => Ok(Self::Attachment {
                heap_type,
                slots: vec![None; layout.heap_capacity(heap_type) as usize],
            }),
        }
    }

    pub fn heap_type(&self) -> DescriptorHeapType {
        match self {
            Self::Shader { .. } => DescriptorHeapType::CbvSrvUav,
            Self::Sampler { .. } => DescriptorHeapType::Sampler,
            Self::Attachment { heap_type, .. } => *heap_type,
        }
    }

    pub fn set_layout(&self) -> Option<vk::DescriptorSetLayout> {
        match self {
            Self::Shader { set_layout, .. } | Self::Sampler { set_layout, .. } => Some(*set_layout),
            Self::Attachment { .. } => None,
        }
    }

    pub fn descriptor_set(&self) -> Option<vk::DescriptorSet> {
        match self {
            Self::Shader { set, .. } | Self::Sampler { set, .. } => Some(*set),
            Self::Attachment { .. } => None,
        }
    }

    pub fn attachment(&self, index: u32) -> Option<AttachmentView> {
        match self {
            Self::Attachment { slots, .. } => slots.get(index as usize).copied().flatten(),
            _ => None,
        }
    }

    /// Writes a buffer view into the shader heap.
    pub fn write_constant_buffer(
        &mut self,
        device: &ash::Device,
        index: u32,
        resource: ResourceId,
        buffer: vk::Buffer,
        offset: u64,
        size: u64,
    ) -> RhiResult<()> {
        let Self::Shader {
            layout, set, slots, ..
        } = self
        else {
            return Err(wrong_heap(DescriptorCategory::ConstantBuffer));
        };
        let element = element_of(layout, DescriptorCategory::ConstantBuffer, index)?;

        let info = [vk::DescriptorBufferInfo::default()
            .buffer(buffer)
            .offset(offset)
            .range(size)];
        let write = vk::WriteDescriptorSet::default()
            .dst_set(*set)
            .dst_binding(CONSTANT_BINDING)
            .dst_array_element(element)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .buffer_info(&info);
        unsafe { device.update_descriptor_sets(&[write], &[]) };

        replace_shader_slot(device, slots, index, Some(resource), None);
        Ok(())
    }

    /// Creates an image view and writes it into the texture or mip range.
    pub fn write_image(
        &mut self,
        device: &ash::Device,
        index: u32,
        resource: ResourceId,
        image: vk::Image,
        desc: &TextureDesc,
        view: &ViewDesc,
    ) -> RhiResult<()> {
        let Self::Shader {
            layout, set, slots, ..
        } = self
        else {
            return Err(wrong_heap(DescriptorCategory::Texture));
        };

        let (category, binding, descriptor_type, image_layout, view_type, base_mip, mip_count) =
            match *view {
                ViewDesc::ShaderResource {
                    dimension,
                    mip_levels,
                    ..
                } => (
                    DescriptorCategory::Texture,
                    TEXTURE_BINDING,
                    vk::DescriptorType::SAMPLED_IMAGE,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    match dimension {
                        ViewDimension::Texture2D => vk::ImageViewType::TYPE_2D,
                        ViewDimension::TextureCube => vk::ImageViewType::CUBE,
                    },
                    0,
                    mip_levels.max(1),
                ),
                ViewDesc::UnorderedAccess { mip, .. } => (
                    DescriptorCategory::Mip,
                    MIP_BINDING,
                    vk::DescriptorType::STORAGE_IMAGE,
                    vk::ImageLayout::GENERAL,
                    vk::ImageViewType::TYPE_2D_ARRAY,
                    mip,
                    1,
                ),
                _ => return Err(wrong_heap(DescriptorCategory::Texture)),
            };
        let element = element_of(layout, category, index)?;

        let image_view = create_view(device, image, desc, view_type, base_mip, mip_count)?;
        let info = [vk::DescriptorImageInfo::default()
            .image_view(image_view)
            .image_layout(image_layout)];
        let write = vk::WriteDescriptorSet::default()
            .dst_set(*set)
            .dst_binding(binding)
            .dst_array_element(element)
            .descriptor_type(descriptor_type)
            .image_info(&info);
        unsafe { device.update_descriptor_sets(&[write], &[]) };

        replace_shader_slot(device, slots, index, Some(resource), Some(image_view));
        Ok(())
    }

    pub fn write_sampler(&mut self, device: &ash::Device, index: u32, desc: &SamplerDesc) -> RhiResult<()> {
        let Self::Sampler { set, samplers, .. } = self else {
            return Err(wrong_heap(DescriptorCategory::Sampler));
        };
        if index as usize >= samplers.len() {
            return Err(RhiError::InvalidHandle(format!("sampler slot {index}")));
        }

        let mut info = vk::SamplerCreateInfo::default()
            .mag_filter(convert::filter(desc.mag_filter))
            .min_filter(convert::filter(desc.min_filter))
            .mipmap_mode(convert::mipmap_mode(desc.mip_filter))
            .address_mode_u(convert::address_mode(desc.address_mode))
            .address_mode_v(convert::address_mode(desc.address_mode))
            .address_mode_w(convert::address_mode(desc.address_mode))
            .max_lod(vk::LOD_CLAMP_NONE);
        if let Some(anisotropy) = desc.max_anisotropy {
            info = info.anisotropy_enable(true).max_anisotropy(anisotropy);
        }
        let sampler = unsafe { device.create_sampler(&info, None)? };

        let image_info = [vk::DescriptorImageInfo::default().sampler(sampler)];
        let write = vk::WriteDescriptorSet::default()
            .dst_set(*set)
            .dst_binding(SAMPLER_BINDING)
            .dst_array_element(index)
            .descriptor_type(vk::DescriptorType::SAMPLER)
            .image_info(&image_info);
        unsafe { device.update_descriptor_sets(&[write], &[]) };

        if let Some(old) = samplers[index as usize].replace(sampler) {
            unsafe { device.destroy_sampler(old, None) };
        }
        Ok(())
    }

    /// Creates an attachment view in an RTV or DSV slot.
    pub fn write_attachment(
        &mut self,
        device: &ash::Device,
        index: u32,
        resource: ResourceId,
        image: vk::Image,
        desc: &TextureDesc,
        mip: u32,
    ) -> RhiResult<()> {
        let Self::Attachment { slots, heap_type } = self else {
            return Err(wrong_heap(DescriptorCategory::RenderTarget));
        };
        if index as usize >= slots.len() {
            return Err(RhiError::InvalidHandle(format!("{heap_type:?} slot {index}")));
        }

        let view = create_view(device, image, desc, vk::ImageViewType::TYPE_2D, mip, 1)?;
        let (width, height) = desc.mip_extent(mip);
        let entry = AttachmentView {
            resource,
            image,
            view,
            extent: vk::Extent2D { width, height },
        };
        if let Some(old) = slots[index as usize].replace(entry) {
            unsafe { device.destroy_image_view(old.view, None) };
        }
        Ok(())
    }

    /// Destroys every view that points at `resource`.
    pub fn forget_resource(&mut self, device: &ash::Device, resource: ResourceId) {
        match self {
            Self::Shader { slots, .. } => {
                for slot in slots.iter_mut() {
                    if slot.is_some_and(|s| s.resource == Some(resource)) {
                        if let Some(view) = slot.take().and_then(|s| s.view) {
                            unsafe { device.destroy_image_view(view, None) };
                        }
                    }
                }
            }
            Self::Attachment { slots, .. } => {
                for slot in slots.iter_mut() {
                    if slot.is_some_and(|s| s.resource == resource)
                        && let Some(old) = slot.take()
                    {
                        unsafe { device.destroy_image_view(old.view, None) };
                    }
                }
            }
            Self::Sampler { .. } => {}
        }
    }

    pub fn destroy(self, device: &ash::Device) {
        unsafe {
            match self {
                Self::Shader {
                    set_layout,
                    pool,
                    slots,
                    ..
                } => {
                    for view in slots.into_iter().flatten().filter_map(|s| s.view) {
                        device.destroy_image_view(view, None);
                    }
                    device.destroy_descriptor_pool(pool, None);
                    device.destroy_descriptor_set_layout(set_layout, None);
                }
                Self::Sampler {
                    set_layout,
                    pool,
                    samplers,
                    ..
                } => {
                    for sampler in samplers.into_iter().flatten() {
                        device.destroy_sampler(sampler, None);
                    }
                    device.destroy_descriptor_pool(pool, None);
                    device.destroy_descriptor_set_layout(set_layout, None);
                }
                Self::Attachment { slots, .. } => {
                    for slot in slots.into_iter().flatten() {
                        device.destroy_image_view(slot.view, None);
                    }
                }
            }
        }
    }
}

fn wrong_heap(category: DescriptorCategory) -> RhiError {
    RhiError::Validation(format!("{category:?} view written into the wrong heap"))
}

/// Array element inside a category's binding.
fn element_of(layout: &HeapLayout, category: DescriptorCategory, index: u32) -> RhiResult<u32> {
    let range = layout.range(category);
    if !range.contains(&index) {
        return Err(RhiError::Validation(format!(
            "slot {index} is outside the {category:?} range {range:?}"
        )));
    }
    Ok(index - range.start)
}

fn replace_shader_slot(
    device: &ash::Device,
    slots: &mut [Option<ShaderSlot>],
    index: u32,
    resource: Option<ResourceId>,
    view: Option<vk::ImageView>,
) {
    let Some(slot) = slots.get_mut(index as usize) else {
        return;
    };
    if let Some(old) = slot.replace(ShaderSlot { resource, view }).and_then(|s| s.view) {
        unsafe { device.destroy_image_view(old, None) };
    }
}

fn create_view(
    device: &ash::Device,
    image: vk::Image,
    desc: &TextureDesc,
    view_type: vk::ImageViewType,
    base_mip: u32,
    mip_count: u32,
) -> RhiResult<vk::ImageView> {
    let layer_count = match view_type {
        vk::ImageViewType::TYPE_2D => 1,
        _ => desc.array_layers,
    };
    let info = vk::ImageViewCreateInfo::default()
        .image(image)
        .view_type(view_type)
        .format(convert::format(desc.format))
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: convert::aspect(desc.format),
            base_mip_level: base_mip,
            level_count: mip_count,
            base_array_layer: 0,
            layer_count,
        });
    Ok(unsafe { device.create_image_view(&info, None)? })
}

/// Creates a one-set pool and an update-after-bind, partially bound layout
/// with one array binding per entry of `counts`.
fn create_set(
    device: &ash::Device,
    counts: &[(vk::DescriptorType, u32)],
) -> RhiResult<(vk::DescriptorSetLayout, vk::DescriptorPool, vk::DescriptorSet)> {
    let bindings: Vec<vk::DescriptorSetLayoutBinding> = counts
        .iter()
        .enumerate()
        .map(|(binding, &(ty, count))| {
            vk::DescriptorSetLayoutBinding::default()
                .binding(binding as u32)
                .descriptor_type(ty)
                .descriptor_count(count)
                .stage_flags(vk::ShaderStageFlags::ALL)
        })
        .collect();
    let flags = vec![
        vk::DescriptorBindingFlags::PARTIALLY_BOUND | vk::DescriptorBindingFlags::UPDATE_AFTER_BIND;
        bindings.len()
    ];
    let mut binding_flags = vk::DescriptorSetLayoutBindingFlagsCreateInfo::default().binding_flags(&flags);

    let layout_info = vk::DescriptorSetLayoutCreateInfo::default()
        .flags(vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL)
        .bindings(&bindings)
        .push_next(&mut binding_flags);
    let set_layout = unsafe { device.create_descriptor_set_layout(&layout_info, None)? };

    let sizes: Vec<vk::DescriptorPoolSize> = counts
        .iter()
        .filter(|(_, count)| *count > 0)
        .map(|&(ty, descriptor_count)| vk::DescriptorPoolSize {
            ty,
            descriptor_count,
        })
        .collect();
    let pool_info = vk::DescriptorPoolCreateInfo::default()
        .flags(vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND)
        .max_sets(1)
        .pool_sizes(&sizes);
    let pool = unsafe { device.create_descriptor_pool(&pool_info, None)? };

    let layouts = [set_layout];
    let alloc_info = vk::DescriptorSetAllocateInfo::default()
        .descriptor_pool(pool)
        .set_layouts(&layouts);
    let set = unsafe { device.allocate_descriptor_sets(&alloc_info)? }
        .into_iter()
        .next()
        .ok_or_else(|| RhiError::Unsupported("descriptor pool returned no set".to_string()))?;

    Ok((set_layout, pool, set))
}
