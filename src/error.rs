use ash::vk;

/// Errors surfaced at the native-call boundary.
///
/// Everything that can go wrong during pool initialization is fatal; the
/// caller is expected to abort backend startup rather than operate a
/// partially constructed ring. Runtime submission failures are reported but
/// the ring keeps advancing so it can never wedge permanently.
#[derive(Debug, thiserror::Error)]
pub enum GpuError {
    #[error("{call} failed: {result:?}")]
    InitFailed {
        call: &'static str,
        result: vk::Result,
    },

    #[error("vkQueueSubmit failed: {0:?}")]
    SubmitFailed(vk::Result),

    #[error("present failed: {result:?} (transient: {transient})")]
    PresentFailed { result: vk::Result, transient: bool },

    #[error("out of device memory")]
    OutOfDeviceMemory,

    #[error("failed to spawn submission worker: {0}")]
    WorkerSpawn(#[from] std::io::Error),
}

impl GpuError {
    pub(crate) fn init(call: &'static str, result: vk::Result) -> GpuError {
        log::error!("{} failed: {:?}", call, result);
        if result == vk::Result::ERROR_OUT_OF_DEVICE_MEMORY {
            GpuError::OutOfDeviceMemory
        } else {
            GpuError::InitFailed { call, result }
        }
    }
}
