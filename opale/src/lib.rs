//! A low-level GPU abstraction over Vulkan.
//!
//! The crate exposes explicit handles for devices, queues, buffers, textures,
//! samplers, shader modules, bind sets, pipelines, command encoders and
//! swapchains. Work is recorded into command lists and submitted to queues;
//! the core keeps the GPU and the CPU honest with three mechanisms:
//!
//! * **Serials**: every queue owns a monotonically increasing 64-bit serial
//!   backed by a timeline semaphore. A submission signals its serial; every
//!   "is this done?" question reduces to comparing serials.
//! * **Usage tracking**: buffers track their last reads/writes per queue,
//!   textures track `(usage, stages, owning queue)` per subresource. Declared
//!   usages are turned into the minimum set of pipeline barriers and
//!   queue-ownership transfers at replay time.
//! * **Deferred reclamation**: destroyed resources, retired descriptor sets
//!   and command buffers are parked on serial-keyed queues and recycled once
//!   the GPU has passed their last use.

pub use ash::{self, vk};

pub use crate::{
    bind_set::{
        BindSet, BindSetDesc, BindSetEntry, BindSetLayout, BindSetLayoutDesc, BindSetLayoutEntry,
        BindingResource, BindingType,
    },
    buffer::Buffer,
    device::Device,
    encoder::{
        CommandEncoder, CommandList, LoadOp, RenderPassColorAttachment,
        RenderPassDepthStencilAttachment, RenderPassDesc, StoreOp,
    },
    error::Error,
    format::{FormatInfo, TextureFormat},
    instance::{Instance, InstanceDesc},
    pipeline::{
        BlendComponent, BlendFactor, BlendOperation, BlendState, ColorTargetState, ComputePipeline,
        ComputePipelineDesc, CullMode, DepthStencilState, FrontFace, PipelineLayout,
        PipelineLayoutDesc, PolygonMode, PrimitiveTopology, PushConstantRange, RenderPipeline,
        RenderPipelineDesc, StencilFaceState, StencilOperation, VertexAttribute,
        VertexBufferLayout, VertexFormat, VertexStepMode,
    },
    queue::Queue,
    sampler::Sampler,
    shader::ShaderModule,
    subresource::{Aspects, SubresourceRange, SubresourceStorage},
    swapchain::{AcquireStatus, PresentMode, Swapchain, SwapchainDesc},
    texture::{Texture, TextureSlice, TextureView},
    types::{
        AddressMode, BorderColor, BufferDesc, BufferUsage, CompareFunction, Extent3d, FilterMode,
        IndexFormat, Origin3d, QueueType, Rect, SamplerDesc, ShaderModuleDesc, ShaderStages,
        ShareMode, TextureAspect, TextureDataLayout, TextureDesc, TextureDimension, TextureUsage,
        TextureViewDesc, Viewport,
    },
};

pub(crate) const MAX_QUEUES: usize = 3;

mod bind_set;
mod buffer;
mod deleter;
mod descriptor;
mod device;
mod encoder;
mod error;
mod format;
mod instance;
mod pipeline;
mod queue;
mod sampler;
mod serial_queue;
mod shader;
mod subresource;
mod swapchain;
mod texture;
mod types;
