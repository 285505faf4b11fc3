mod common;

use std::sync::Arc;

use tephra::{
    ash::vk::Handle,
    prelude::*,
    shader::{DescriptorResource, collect_writes},
};

const TEXTURE_ARRAY: &[u32] = inline_spirv::inline_spirv!(
    r#"
    #version 450
    layout(local_size_x = 1) in;
    layout(set = 0, binding = 0) uniform sampler2D textures[8];
    layout(set = 0, binding = 1) buffer Out { vec4 color; } result;
    void main() {
        result.color = texture(textures[0], vec2(0.5)) + texture(textures[2], vec2(0.5));
    }
    "#,
    comp
);

fn layout(device: &Device) -> Arc<PipelineLayout> {
    let stage = ShaderStage::new(
        device.clone(),
        TEXTURE_ARRAY,
        vk::ShaderStageFlags::COMPUTE,
        "main",
    )
    .unwrap();
    Arc::new(PipelineLayout::new(device.clone(), &[&stage], &LayoutInfo::default()).unwrap())
}

#[test]
fn image_array_writes_only_assigned_elements() {
    let Some((device, allocator)) = common::setup() else {
        return;
    };
    let layout = layout(&device);
    let sampler = Arc::new(Sampler::linear(device.clone()).unwrap());
    let info = ImageInfo::new_2d(
        vk::Format::R8G8B8A8_UNORM,
        4,
        4,
        vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
    );
    let views: Vec<ImageView> = (0..3)
        .map(|_| {
            Arc::new(Image::new_private(allocator.clone(), &info).unwrap())
                .full_view()
                .unwrap()
        })
        .collect();

    let mut params = ShaderParameter::new();
    for (i, view) in views.iter().enumerate() {
        params["textures"][i as u32].set((view.clone(), sampler.clone()));
    }

    let writes = collect_writes(&params, layout.parameters());
    assert_eq!(writes.dropped, 0);
    let elements: Vec<u32> = writes
        .descriptors
        .iter()
        .map(|w| {
            assert_eq!((w.set, w.binding), (0, 0));
            assert_eq!(w.ty, vk::DescriptorType::COMBINED_IMAGE_SAMPLER);
            assert!(matches!(w.resource, DescriptorResource::Image { .. }));
            w.array_element
        })
        .collect();
    assert_eq!(elements, [0, 1, 2]);

    let mut ctx = CommandContext::new(device.clone(), allocator.clone(), 0, ContextConfig::default());
    ctx.begin().unwrap();
    for view in &views {
        ctx.clear_color(view, vk::ClearColorValue { float32: [0.25; 4] })
            .unwrap();
    }
    let out = ctx
        .get_transient_buffer::<[f32; 4]>(1, vk::BufferUsageFlags::STORAGE_BUFFER)
        .unwrap();
    params["result"].set(out);
    let sets = ctx.get_descriptor_sets(&layout).unwrap();
    let push_constants = ctx.update_descriptor_sets(&sets, &params).unwrap();
    assert!(push_constants.is_empty());
    let value = ctx.submit(0, &[], &[]).unwrap();
    device.wait_for_timeline(value).unwrap();

    let state = views[1].image().get_state(0, 0).unwrap();
    assert_eq!(state.layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
}

#[test]
fn descriptor_pools_grow_on_exhaustion() {
    let Some((device, allocator)) = common::setup() else {
        return;
    };
    let layout = layout(&device);
    let config = ContextConfig {
        descriptor_pool_max_sets: 2,
        descriptors_per_type: 16,
        ..Default::default()
    };
    let mut ctx = CommandContext::new(device, allocator, 0, config);
    ctx.begin().unwrap();
    let sets: Vec<DescriptorSets> = (0..5)
        .map(|_| ctx.get_descriptor_sets(&layout).unwrap())
        .collect();
    assert!(ctx.descriptor_pool_count() >= 3);
    for (i, a) in sets.iter().enumerate() {
        for b in &sets[i + 1..] {
            assert_ne!(a.raw(), b.raw());
        }
    }
    ctx.submit(0, &[], &[]).unwrap();

    let pools = ctx.descriptor_pool_count();
    ctx.begin().unwrap();
    let reused = ctx.get_descriptor_sets(&layout).unwrap();
    assert_eq!(reused.raw(), sets[0].raw());
    assert_eq!(ctx.descriptor_pool_count(), pools);
    ctx.submit(0, &[], &[]).unwrap();
}

#[test]
fn acceleration_structure_barrier_follows_storage() {
    let Some((device, allocator)) = common::setup() else {
        return;
    };
    let storage = BufferView::from(Arc::new(
        Buffer::new_private(allocator.clone(), 256, 256, vk::BufferUsageFlags::STORAGE_BUFFER)
            .unwrap(),
    ));
    let mut ctx = CommandContext::new(device, allocator, 0, ContextConfig::default());
    ctx.add_buffer_barrier(&storage, Access::COMPUTE_WRITE);
    assert!(!ctx.has_pending_barriers());

    let resource = DescriptorResource::AccelerationStructure {
        handle: vk::AccelerationStructureKHR::null(),
        storage: storage.clone(),
    };
    let access = Access::shader(
        vk::PipelineStageFlags2::COMPUTE_SHADER,
        vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
        false,
    );
    ctx.add_descriptor_barrier(&resource, access);
    assert!(ctx.has_pending_barriers());
    assert_eq!(
        storage.get_state().access,
        vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR
    );
}
