mod common;

use tephra::{ash::vk::Handle, prelude::*};

fn cache_path(name: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!("tephra-{}-{name}", std::process::id()))
}

#[test]
fn missing_cache_file_loads_empty() {
    let Some((device, _)) = common::setup() else {
        return;
    };
    let path = cache_path("missing.cache");
    let _ = std::fs::remove_file(&path);
    let cache = PipelineCache::load(device, &path).unwrap();
    assert!(!cache.vk_handle().is_null());
}

#[test]
fn corrupt_cache_file_loads_empty() {
    let Some((device, _)) = common::setup() else {
        return;
    };
    let path = cache_path("corrupt.cache");
    std::fs::write(&path, b"not a pipeline cache").unwrap();
    let cache = PipelineCache::load(device.clone(), &path).unwrap();
    assert!(!cache.vk_handle().is_null());

    cache.store(&path).unwrap();
    let reloaded = PipelineCache::load(device, &path).unwrap();
    assert!(!reloaded.vk_handle().is_null());
    std::fs::remove_file(&path).unwrap();
}
