//! Physical device selection.
//!
//! Every adapter is checked for Vulkan 1.3, a graphics queue family that
//! can also present (when a surface exists), timeline semaphores and
//! descriptor indexing. Qualifying adapters are scored and the best one is
//! chosen. Hardware adapters normally win; with the software flag set a
//! CPU implementation (lavapipe, SwiftShader) is preferred instead.

use std::ffi::CStr;

use ash::vk;
use tracing::{debug, info, warn};

use crate::error::{RhiError, RhiResult};
use crate::types::{AdapterInfo, AdapterKind};

/// A chosen physical device.
#[derive(Clone)]
pub struct Adapter {
    pub device: vk::PhysicalDevice,
    pub properties: vk::PhysicalDeviceProperties,
    pub queue_family: u32,
    pub info: AdapterInfo,
}

impl std::fmt::Debug for Adapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Adapter")
            .field("name", &self.info.name)
            .field("kind", &self.info.kind)
            .field("api_version", &self.info.api_version)
            .field("queue_family", &self.queue_family)
            .finish()
    }
}

/// Maps a Vulkan device type.
pub fn adapter_kind(device_type: vk::PhysicalDeviceType) -> AdapterKind {
    match device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => AdapterKind::Discrete,
        vk::PhysicalDeviceType::INTEGRATED_GPU => AdapterKind::Integrated,
        vk::PhysicalDeviceType::VIRTUAL_GPU => AdapterKind::Virtual,
        vk::PhysicalDeviceType::CPU => AdapterKind::Cpu,
        _ => AdapterKind::Other,
    }
}

/// Scores an adapter kind. Higher is better.
pub fn rate(kind: AdapterKind, prefer_software: bool) -> u32 {
    let base = match kind {
        AdapterKind::Discrete => 10_000,
        AdapterKind::Integrated => 1_000,
        AdapterKind::Virtual => 100,
        AdapterKind::Cpu => 10,
        AdapterKind::Other => 1,
    };
    if prefer_software && kind == AdapterKind::Cpu {
        base + 100_000
    } else {
        base
    }
}

/// Picks the best adapter.
///
/// # Errors
///
/// Returns [`RhiError::NoSuitableGpu`] when nothing qualifies.
pub fn select_adapter(
    instance: &ash::Instance,
    surface: Option<(&ash::khr::surface::Instance, vk::SurfaceKHR)>,
    prefer_software: bool,
) -> RhiResult<Adapter> {
    let devices = unsafe { instance.enumerate_physical_devices()? };
    if devices.is_empty() {
        warn!("No Vulkan adapters found");
        return Err(RhiError::NoSuitableGpu);
    }
    info!("Found {} adapter(s)", devices.len());

    let mut best: Option<(Adapter, u32)> = None;
    for device in devices {
        let Some(adapter) = check_adapter(instance, device, surface) else {
            continue;
        };
        let score = rate(adapter.info.kind, prefer_software);
        debug!("Adapter '{}' ({:?}) scored {}", adapter.info.name, adapter.info.kind, score);
        if best.as_ref().is_none_or(|(_, s)| score > *s) {
            best = Some((adapter, score));
        }
    }

    let Some((adapter, score)) = best else {
        warn!("No adapter meets the requirements");
        return Err(RhiError::NoSuitableGpu);
    };

    if prefer_software && !adapter.info.is_software() {
        warn!(
            "Software adapter requested but none found, using '{}'",
            adapter.info.name
        );
    }
    info!(
        "Selected adapter '{}' ({:?}), Vulkan {}, score {}",
        adapter.info.name, adapter.info.kind, adapter.info.api_version, score
    );
    Ok(adapter)
}

fn check_adapter(
    instance: &ash::Instance,
    device: vk::PhysicalDevice,
    surface: Option<(&ash::khr::surface::Instance, vk::SurfaceKHR)>,
) -> Option<Adapter> {
    let properties = unsafe { instance.get_physical_device_properties(device) };
    let name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
        .to_string_lossy()
        .into_owned();

    let version = properties.api_version;
    if vk::api_version_major(version) == 1 && vk::api_version_minor(version) < 3 {
        debug!("Adapter '{}' skipped: Vulkan 1.3 not supported", name);
        return None;
    }

    let mut features_1_2 = vk::PhysicalDeviceVulkan12Features::default();
    let mut features_1_3 = vk::PhysicalDeviceVulkan13Features::default();
    let mut features = vk::PhysicalDeviceFeatures2::default()
        .push_next(&mut features_1_2)
        .push_next(&mut features_1_3);
    unsafe { instance.get_physical_device_features2(device, &mut features) };
    let anisotropy = features.features.sampler_anisotropy;

    if features_1_2.timeline_semaphore == vk::FALSE
        || features_1_2.descriptor_indexing == vk::FALSE
        || features_1_2.runtime_descriptor_array == vk::FALSE
        || features_1_2.descriptor_binding_partially_bound == vk::FALSE
        || features_1_2.descriptor_binding_uniform_buffer_update_after_bind == vk::FALSE
        || features_1_2.descriptor_binding_sampled_image_update_after_bind == vk::FALSE
        || features_1_2.descriptor_binding_storage_image_update_after_bind == vk::FALSE
        || anisotropy == vk::FALSE
        || features_1_3.dynamic_rendering == vk::FALSE
        || features_1_3.synchronization2 == vk::FALSE
    {
        debug!("Adapter '{}' skipped: missing required features", name);
        return None;
    }

    let Some(queue_family) = find_queue_family(instance, device, surface) else {
        debug!("Adapter '{}' skipped: no graphics queue that can present", name);
        return None;
    };

    let kind = adapter_kind(properties.device_type);
    let info = AdapterInfo {
        name,
        kind,
        vendor_id: properties.vendor_id,
        device_id: properties.device_id,
        api_version: format!(
            "{}.{}.{}",
            vk::api_version_major(version),
            vk::api_version_minor(version),
            vk::api_version_patch(version)
        ),
    };

    Some(Adapter {
        device,
        properties,
        queue_family,
        info,
    })
}

/// First family with graphics and compute support that can present to the
/// surface, if there is one.
fn find_queue_family(
    instance: &ash::Instance,
    device: vk::PhysicalDevice,
    surface: Option<(&ash::khr::surface::Instance, vk::SurfaceKHR)>,
) -> Option<u32> {
    let families = unsafe { instance.get_physical_device_queue_family_properties(device) };

    families.iter().enumerate().find_map(|(i, family)| {
        let i = i as u32;
        let flags = family.queue_flags;
        if family.queue_count == 0
            || !flags.contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
        {
            return None;
        }
        let presents = match surface {
            Some((loader, surface)) => unsafe {
                loader
                    .get_physical_device_surface_support(device, i, surface)
                    .unwrap_or(false)
            },
            None => true,
        };
        presents.then_some(i)
    })
}
