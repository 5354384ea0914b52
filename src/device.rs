//! Devices, capability queries and execution streams.
//!
//! A [`Stream`] is the explicit execution context every operator takes. It
//! pins the device the call targets and owns the thread pool the call's
//! parallel work runs on, so two streams never share scheduling state.

use crate::error::{Result, SpnError};
use crate::gpu::GpuHashgrid;
use log::{debug, info};
use std::sync::Arc;

/// Per-block shared memory budget reported for the CPU device.
///
/// A block on the CPU is one rayon task; its staged tables should stay
/// resident in a core's L2 cache.
pub const CPU_SHARED_MEM_PER_BLOCK: usize = 256 * 1024;

/// GPU device context containing all resources needed for compute operations.
#[derive(Clone)]
pub struct GpuContext {
    /// The wgpu device for creating GPU resources
    pub device: Arc<wgpu::Device>,
    /// The command queue for submitting GPU work
    pub queue: Arc<wgpu::Queue>,
    /// Information about the selected adapter
    pub adapter_info: wgpu::AdapterInfo,
    /// Configured limits for this device
    pub limits: wgpu::Limits,
    /// Supported features on this device
    pub features: wgpu::Features,
}

impl GpuContext {
    /// Creates a new GPU context with the best available adapter.
    ///
    /// Discrete GPUs are preferred, then integrated, virtual and software
    /// adapters.
    ///
    /// # Errors
    /// Returns an error if no suitable GPU adapter is found or device creation fails.
    pub async fn new() -> Result<Self> {
        let instance = create_instance();
        let adapter = select_best_adapter(&instance).await?;

        Self::from_adapter(adapter).await
    }

    /// Creates a GPU context from a specific adapter.
    pub async fn from_adapter(adapter: wgpu::Adapter) -> Result<Self> {
        let adapter_info = adapter.get_info();
        info!(
            "Selected GPU adapter: {} ({:?})",
            adapter_info.name, adapter_info.device_type
        );

        // Take whatever the adapter offers; workgroup storage is what the
        // launch configurations are sized against.
        let required_limits = adapter.limits();

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("Particle Ops Device"),
                required_features: wgpu::Features::empty(),
                required_limits,
                memory_hints: wgpu::MemoryHints::default(),
                trace: Default::default(),
            })
            .await
            .map_err(|e| SpnError::GpuInitError(format!("Failed to create device: {}", e)))?;

        let limits = device.limits();
        let features = device.features();

        debug!("Device limits: {:?}", limits);
        debug!("Device features: {:?}", features);

        Ok(Self {
            device: Arc::new(device),
            queue: Arc::new(queue),
            adapter_info,
            limits,
            features,
        })
    }

    /// Workgroup shared memory available to one compute block, in bytes.
    pub fn shared_mem_per_block(&self) -> usize {
        self.device.limits().max_compute_workgroup_storage_size as usize
    }

    /// Gets a human-readable description of the GPU device.
    pub fn device_description(&self) -> String {
        format!(
            "{} ({:?}, driver: {})",
            self.adapter_info.name, self.adapter_info.device_type, self.adapter_info.driver
        )
    }
}

/// The device an operator call executes on.
#[derive(Clone)]
pub enum Device {
    /// Host execution on a rayon pool.
    Cpu,
    /// A wgpu device; passes without a GPU kernel run on the stream's pool.
    Gpu(GpuContext),
}

impl Device {
    /// Per-block shared memory budget of this device, in bytes.
    ///
    /// This is a live query; callers sizing a launch must ask again for every
    /// device rather than remembering one answer for all of them.
    pub fn shared_mem_per_block(&self) -> usize {
        match self {
            Device::Cpu => CPU_SHARED_MEM_PER_BLOCK,
            Device::Gpu(ctx) => ctx.shared_mem_per_block(),
        }
    }

    /// Gets a human-readable description of the device.
    pub fn description(&self) -> String {
        match self {
            Device::Cpu => "cpu".to_string(),
            Device::Gpu(ctx) => ctx.device_description(),
        }
    }

    /// The GPU context, if this is a GPU device.
    pub fn gpu(&self) -> Option<&GpuContext> {
        match self {
            Device::Cpu => None,
            Device::Gpu(ctx) => Some(ctx),
        }
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.description())
    }
}

/// Reports the per-block shared memory budget of `device`, in bytes.
pub fn device_shared_mem(device: &Device) -> usize {
    device.shared_mem_per_block()
}

/// Configuration for an execution stream.
#[derive(Clone, Debug)]
pub struct StreamConfig {
    /// Worker threads; `0` lets rayon pick one per core.
    pub num_threads: usize,
    /// Prefix for worker thread names.
    pub label: String,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            num_threads: 0,
            label: "spn-stream".to_string(),
        }
    }
}

impl StreamConfig {
    /// Validates the configuration.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.label.is_empty() {
            return Err("label must not be empty".to_string());
        }
        if self.num_threads > 4096 {
            return Err(format!("num_threads ({}) is unreasonably large", self.num_threads));
        }
        Ok(())
    }
}

/// Explicit execution context threaded through every operator call.
///
/// Work submitted on one stream runs in submission order; the library never
/// synchronizes across streams. A GPU stream compiles its compute pipelines
/// when it is created; clones share them.
#[derive(Clone)]
pub struct Stream {
    device: Device,
    pool: Arc<rayon::ThreadPool>,
    hashgrid: Option<Arc<GpuHashgrid>>,
}

impl Stream {
    /// Creates a CPU stream with the default configuration.
    pub fn cpu() -> Result<Self> {
        Self::with_config(Device::Cpu, StreamConfig::default())
    }

    /// Creates a stream bound to a GPU context.
    pub fn gpu(context: GpuContext) -> Result<Self> {
        Self::with_config(Device::Gpu(context), StreamConfig::default())
    }

    /// Creates a stream on `device` with an explicit configuration.
    pub fn with_config(device: Device, config: StreamConfig) -> Result<Self> {
        config.validate().map_err(SpnError::InvalidArgument)?;

        let label = config.label.clone();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.num_threads)
            .thread_name(move |i| format!("{}-{}", label, i))
            .build()
            .map_err(|e| SpnError::InvalidArgument(format!("Failed to build thread pool: {}", e)))?;

        let hashgrid = match &device {
            Device::Cpu => None,
            Device::Gpu(ctx) => Some(Arc::new(GpuHashgrid::new(ctx.clone())?)),
        };

        debug!(
            "Created stream '{}' on {} with {} threads",
            config.label,
            device.description(),
            pool.current_num_threads()
        );

        Ok(Self {
            device,
            pool: Arc::new(pool),
            hashgrid,
        })
    }

    /// The device this stream targets.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Number of worker threads on this stream.
    pub fn num_threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Hash-grid pipelines of a GPU stream.
    pub(crate) fn hashgrid_pass(&self) -> Option<&Arc<GpuHashgrid>> {
        self.hashgrid.as_ref()
    }

    /// Runs `op` inside this stream's thread pool.
    pub(crate) fn install<R, F>(&self, op: F) -> R
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        self.pool.install(op)
    }
}

/// Creates a wgpu instance with appropriate backends for the platform.
fn create_instance() -> wgpu::Instance {
    wgpu::Instance::new(&wgpu::InstanceDescriptor {
        backends: wgpu::Backends::all(),
        ..Default::default()
    })
}

/// Selects the best available adapter for compute workloads.
async fn select_best_adapter(instance: &wgpu::Instance) -> Result<wgpu::Adapter> {
    let adapter = instance
        .request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            force_fallback_adapter: false,
            compatible_surface: None,
        })
        .await;

    if let Ok(adapter) = adapter {
        let info = adapter.get_info();
        if matches!(info.device_type, wgpu::DeviceType::DiscreteGpu) {
            return Ok(adapter);
        }
    }

    let adapter = instance
        .enumerate_adapters(wgpu::Backends::all())
        .into_iter()
        .max_by_key(|adapter| match adapter.get_info().device_type {
            wgpu::DeviceType::DiscreteGpu => 3,
            wgpu::DeviceType::IntegratedGpu => 2,
            wgpu::DeviceType::VirtualGpu => 1,
            wgpu::DeviceType::Cpu => 0,
            wgpu::DeviceType::Other => 1,
        });

    adapter.ok_or_else(|| SpnError::GpuInitError("No suitable GPU adapter found".to_string()))
}
