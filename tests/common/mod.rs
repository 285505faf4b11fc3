use tephra::{Allocator, Device};

/// Installs a test log subscriber and opens the default device, or returns `None` when
/// this machine has no usable Vulkan implementation.
pub fn setup() -> Option<(Device, Allocator)> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    let device = match Device::create_system_default() {
        Ok(device) => device,
        Err(err) => {
            tracing::warn!(%err, "skipping test: no Vulkan device");
            return None;
        }
    };
    let allocator = Allocator::new(device.clone()).ok()?;
    Some((device, allocator))
}
