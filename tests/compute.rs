mod common;

use std::sync::Arc;

use tephra::prelude::*;

const SCALE_OFFSET: &[u32] = inline_spirv::inline_spirv!(
    r#"
    #version 450
    layout(local_size_x = 64) in;
    layout(set = 0, binding = 0) uniform Params { float scale; float offset; } params;
    layout(set = 0, binding = 1) buffer Data { float values[]; } data;
    void main() {
        uint i = gl_GlobalInvocationID.x;
        if (i >= data.values.length()) return;
        data.values[i] = data.values[i] * params.scale + params.offset;
    }
    "#,
    comp
);

const ECHO_UNIFORM: &[u32] = inline_spirv::inline_spirv!(
    r#"
    #version 450
    layout(local_size_x = 1) in;
    layout(set = 0, binding = 0) uniform Block { vec4 padding; uint marker; float value; } block;
    layout(set = 0, binding = 1) buffer Out { uint words[]; } result;
    void main() {
        result.words[0] = block.marker;
        result.words[1] = floatBitsToUint(block.value);
    }
    "#,
    comp
);

fn compute_pipeline(device: &Device, spirv: &[u32]) -> Pipeline {
    let stage = ShaderStage::new(device.clone(), spirv, vk::ShaderStageFlags::COMPUTE, "main")
        .unwrap();
    let layout =
        Arc::new(PipelineLayout::new(device.clone(), &[&stage], &LayoutInfo::default()).unwrap());
    PipelineCache::null(device.clone())
        .create_compute_pipeline(layout, &stage)
        .unwrap()
}

fn readback_buffer(allocator: &Allocator, size: u64) -> BufferView {
    let buffer = Buffer::new_readback(
        allocator.clone(),
        size,
        4,
        vk::BufferUsageFlags::TRANSFER_DST,
    )
    .unwrap();
    BufferView::from(Arc::new(buffer))
}

#[test]
fn scale_offset_dispatch() {
    let Some((device, allocator)) = common::setup() else {
        return;
    };
    let pipeline = compute_pipeline(&device, SCALE_OFFSET);
    assert_eq!(pipeline.workgroup_count([5, 1, 1]), [1, 1, 1]);

    let mut ctx = CommandContext::new(device.clone(), allocator.clone(), 0, ContextConfig::default());
    ctx.begin().unwrap();
    let input = [1.0f32, 2.0, 3.0, 4.0, 5.0];
    let data = ctx
        .upload_data(
            bytemuck::cast_slice(&input),
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_SRC,
        )
        .unwrap();

    let mut params = ShaderParameter::new();
    params["data"].set(data.clone());
    params["params"]["scale"].set(2.0f32);
    params["params"]["offset"].set(0.5f32);
    ctx.push_debug_label("scale_offset", [1.0, 0.0, 0.0, 1.0]).unwrap();
    ctx.dispatch(&pipeline, [input.len() as u32, 1, 1], &params).unwrap();
    ctx.pop_debug_label().unwrap();

    let readback = readback_buffer(&allocator, data.size());
    ctx.copy_buffer(&data, &readback).unwrap();
    ctx.add_buffer_barrier(&readback, Access::HOST_READ);
    let value = ctx.submit(0, &[], &[]).unwrap();
    assert_eq!(ctx.last_submit(), value);
    device.wait_for_timeline(value).unwrap();
    assert!(device.current_timeline_value().unwrap() >= value);

    let result: Vec<f32> = bytemuck::pod_collect_to_vec(&readback.read().unwrap());
    assert_eq!(result, [2.5, 4.5, 6.5, 8.5, 10.5]);
}

#[test]
fn uniform_constant_round_trip() {
    let Some((device, allocator)) = common::setup() else {
        return;
    };
    let pipeline = compute_pipeline(&device, ECHO_UNIFORM);
    let block = pipeline.layout().parameters().root.find("block.value").unwrap();
    assert!(matches!(
        &block.kind,
        tephra::shader::BindingKind::Constant(c) if c.offset == 20 && !c.push_constant
    ));

    let mut ctx = CommandContext::new(device.clone(), allocator.clone(), 0, ContextConfig::default());
    ctx.begin().unwrap();
    let out = ctx
        .get_transient_buffer::<u32>(2, vk::BufferUsageFlags::STORAGE_BUFFER)
        .unwrap();
    let mut params = ShaderParameter::new();
    params["result"].set(out.clone());
    params["block"]["marker"].set(0xC0FFEEu32);
    params["block"]["value"].set(3.25f32);
    ctx.dispatch(&pipeline, [1, 1, 1], &params).unwrap();

    let readback = readback_buffer(&allocator, 8);
    ctx.copy_buffer(out.view(), &readback).unwrap();
    ctx.add_buffer_barrier(&readback, Access::HOST_READ);
    let value = ctx.submit(0, &[], &[]).unwrap();
    device.wait_for_timeline(value).unwrap();

    let bytes = readback.read().unwrap();
    assert_eq!(&bytes[0..4], 0xC0FFEEu32.to_ne_bytes());
    assert_eq!(&bytes[4..8], 3.25f32.to_ne_bytes());
}

#[test]
fn copy_into_smaller_buffer_fails() {
    let Some((device, allocator)) = common::setup() else {
        return;
    };
    let mut ctx = CommandContext::new(device, allocator.clone(), 0, ContextConfig::default());
    ctx.begin().unwrap();
    let src = ctx.upload_host(&[0u8; 20]).unwrap();
    let dst = readback_buffer(&allocator, 16);
    let err = ctx.copy_buffer(&src, &dst).unwrap_err();
    assert!(matches!(
        err,
        Error::CopyOverflow {
            src_size: 20,
            dst_size: 16
        }
    ));
}

#[test]
fn recording_state_is_enforced() {
    let Some((device, allocator)) = common::setup() else {
        return;
    };
    let mut ctx = CommandContext::new(device, allocator, 0, ContextConfig::default());
    assert!(matches!(
        ctx.submit(0, &[], &[]),
        Err(Error::InvalidState(_))
    ));
    ctx.begin().unwrap();
    assert!(ctx.is_recording());
    assert!(matches!(ctx.begin(), Err(Error::InvalidState(_))));
    let first = ctx.submit(0, &[], &[]).unwrap();
    ctx.begin().unwrap();
    let second = ctx.submit(0, &[], &[]).unwrap();
    assert!(second > first);
}

#[test]
fn transient_buffers_are_reused_after_begin() {
    let Some((device, allocator)) = common::setup() else {
        return;
    };
    let mut ctx = CommandContext::new(device, allocator, 0, ContextConfig::default());
    ctx.begin().unwrap();
    let first = ctx
        .get_transient_buffer::<f32>(64, vk::BufferUsageFlags::STORAGE_BUFFER)
        .unwrap();
    ctx.submit(0, &[], &[]).unwrap();
    assert_eq!(ctx.transient_buffer_count(), 1);

    ctx.begin().unwrap();
    let second = ctx
        .get_transient_buffer::<f32>(16, vk::BufferUsageFlags::STORAGE_BUFFER)
        .unwrap();
    assert_eq!(ctx.transient_buffer_count(), 1);
    assert_eq!(first.view().vk_handle(), second.view().vk_handle());
    assert_eq!(second.len(), 16);
    ctx.submit(0, &[], &[]).unwrap();
}
