// Backend module - Vulkan abstraction layer
//
// Design: Thin wrapper around ash with safety and ergonomics
// Performance: Zero-cost abstractions, explicit control

pub mod descriptors;
pub mod device;
pub mod frame;
pub mod pipeline;
pub mod resource;
pub mod shader;
pub mod swapchain;
pub mod sync;
pub mod upload;

pub use device::VulkanDevice;
pub use swapchain::Swapchain;
