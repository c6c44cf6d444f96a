use std::ops::Deref;

use ash::{extensions::khr, vk};
use parking_lot::Mutex;

/// Shared handles for the device this subsystem drives.
///
/// The device, queue and swapchain loader are supplied by the platform
/// layer; the context never creates or destroys them. It exists so that no
/// component has to reach for process-wide globals: everything that talks
/// to the GPU holds an `Arc<Context>`.
pub struct Context {
    device: ash::Device,
    queue: Mutex<vk::Queue>,
    queue_family_index: u32,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    non_coherent_atom_size: vk::DeviceSize,
    swapchain_loader: Option<khr::Swapchain>,
}

impl Context {
    pub fn new(
        device: ash::Device,
        queue: vk::Queue,
        queue_family_index: u32,
        memory_properties: vk::PhysicalDeviceMemoryProperties,
        limits: &vk::PhysicalDeviceLimits,
        swapchain_loader: Option<khr::Swapchain>,
    ) -> Context {
        Context {
            device,
            queue: Mutex::new(queue),
            queue_family_index,
            memory_properties,
            non_coherent_atom_size: limits.non_coherent_atom_size.max(1),
            swapchain_loader,
        }
    }

    pub fn vk(&self) -> &ash::Device {
        &self.device
    }

    /// The queue is externally synchronized; every submit or present locks it.
    pub(crate) fn queue(&self) -> &Mutex<vk::Queue> {
        &self.queue
    }

    pub(crate) fn queue_family_index(&self) -> u32 {
        self.queue_family_index
    }

    pub(crate) fn swapchain_loader(&self) -> Option<&khr::Swapchain> {
        self.swapchain_loader.as_ref()
    }

    pub(crate) fn non_coherent_atom_size(&self) -> vk::DeviceSize {
        self.non_coherent_atom_size
    }

    /// Picks a memory type out of `type_bits` carrying all of `required`,
    /// preferring one that also carries `preferred`. Returns the type index
    /// and its full property flags.
    pub(crate) fn find_memory_type(
        &self,
        type_bits: u32,
        required: vk::MemoryPropertyFlags,
        preferred: vk::MemoryPropertyFlags,
    ) -> Option<(u32, vk::MemoryPropertyFlags)> {
        let candidates = || {
            self.memory_properties.memory_types[..self.memory_properties.memory_type_count as usize]
                .iter()
                .enumerate()
                .filter(|&(ix, mt)| {
                    (type_bits & (1 << ix)) != 0 && mt.property_flags.contains(required)
                })
        };

        candidates()
            .find(|(_, mt)| mt.property_flags.contains(preferred))
            .or_else(|| candidates().next())
            .map(|(ix, mt)| (ix as u32, mt.property_flags))
    }
}

impl Deref for Context {
    type Target = ash::Device;

    fn deref(&self) -> &ash::Device {
        &self.device
    }
}
