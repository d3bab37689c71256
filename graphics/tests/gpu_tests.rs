//! GPU integration tests for the graphics crate.
//!
//! Tests are parameterized using `rstest` to run against every backend. The
//! wgpu cases skip themselves when the feature is off or no adapter exists.
//!
//! ```bash
//! cargo test -p avatar-graphics --test gpu_tests
//! cargo test -p avatar-graphics --features wgpu-backend --test gpu_tests
//! ```

mod common;

use std::sync::Arc;

use rstest::rstest;

use avatar_graphics::{
    BindingKind, BindingSlot, BufferBinding, BufferDescriptor, ComputeDispatch, ComputeShader,
    GraphicsError, HostDispatch, HostKernel, ShaderDefines, workgroup_count,
};
use common::{Backend, TestContext};

const SCALE_SHADER: &str = r#"#version 450
layout(local_size_x = 64) in;

layout(std430, set = 0, binding = 0) readonly buffer InputBlock {
    uint data[];
} _Input;

layout(std430, set = 0, binding = 1) buffer OutputBlock {
    uint data[];
} _Output;

layout(std140, set = 0, binding = 2) uniform ParamsBlock {
    uvec4 countAndFactor;
} _Params;

void main() {
    uint index = gl_GlobalInvocationID.x;
    if (index >= _Params.countAndFactor.x) {
        return;
    }
#ifdef ADD_ONE
    _Output.data[index] = _Input.data[index] * _Params.countAndFactor.y + 1u;
#else
    _Output.data[index] = _Input.data[index] * _Params.countAndFactor.y;
#endif
}
"#;

struct ScaleKernel;

impl HostKernel for ScaleKernel {
    fn execute(&self, dispatch: &mut HostDispatch<'_>) -> Result<(), GraphicsError> {
        let params: Vec<u32> = bytemuck::pod_collect_to_vec(dispatch.read(2)?);
        let (count, factor) = (params[0], params[1]);
        let add = u32::from(dispatch.is_defined("ADD_ONE"));
        let input: Vec<u32> = bytemuck::pod_collect_to_vec(dispatch.read(0)?);
        let output = dispatch.take_write(1)?;
        for index in 0..count.min(dispatch.invocations_x()) as usize {
            let value = input[index].wrapping_mul(factor).wrapping_add(add);
            output[index * 4..index * 4 + 4].copy_from_slice(&value.to_le_bytes());
        }
        Ok(())
    }
}

fn scale_shader() -> Arc<ComputeShader> {
    Arc::new(
        ComputeShader::new("scale", SCALE_SHADER)
            .with_binding(BindingSlot::new("_Input", 0, BindingKind::StorageRead))
            .with_binding(BindingSlot::new("_Output", 1, BindingKind::StorageReadWrite))
            .with_binding(BindingSlot::new("_Params", 2, BindingKind::Uniform))
            .with_host_kernel(Arc::new(ScaleKernel)),
    )
}

#[rstest]
#[case::dummy(Backend::Dummy)]
#[case::webgpu(Backend::WebGpu)]
fn test_buffer_write_read_roundtrip(#[case] backend: Backend) {
    let Some(ctx) = TestContext::new(backend) else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };

    let data: Vec<u8> = (0..256u32).map(|i| (i * 7) as u8).collect();
    let buffer = ctx
        .device
        .create_buffer(&BufferDescriptor::storage(data.len() as u64).with_label("roundtrip"))
        .unwrap();
    ctx.device.write_buffer(&buffer, 0, &data).unwrap();
    ctx.device.write_buffer(&buffer, 16, &[0xAA; 4]).unwrap();

    let readback = ctx.device.read_buffer(&buffer, 0, data.len() as u64).unwrap();
    assert_eq!(&readback[..16], &data[..16]);
    assert_eq!(&readback[16..20], &[0xAA; 4]);
    assert_eq!(&readback[20..], &data[20..]);
}

#[rstest]
#[case::dummy_plain(Backend::Dummy, false)]
#[case::dummy_add_one(Backend::Dummy, true)]
#[case::webgpu_plain(Backend::WebGpu, false)]
#[case::webgpu_add_one(Backend::WebGpu, true)]
fn test_compute_dispatch(#[case] backend: Backend, #[case] add_one: bool) {
    let Some(ctx) = TestContext::new(backend) else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };
    let device = &ctx.device;

    let count = 100u32;
    let input: Vec<u32> = (0..count).collect();
    let input_buffer = device.create_buffer(&BufferDescriptor::storage(400)).unwrap();
    let output_buffer = device.create_buffer(&BufferDescriptor::storage(400)).unwrap();
    let params_buffer = device.create_buffer(&BufferDescriptor::uniform(16)).unwrap();
    device
        .write_buffer(&input_buffer, 0, bytemuck::cast_slice(&input))
        .unwrap();
    device
        .write_buffer(&params_buffer, 0, bytemuck::cast_slice(&[count, 3u32, 0, 0]))
        .unwrap();

    let mut defines = ShaderDefines::new();
    if add_one {
        defines.enable("ADD_ONE");
    }
    let pipeline = device.create_compute_pipeline(&scale_shader(), &defines).unwrap();

    let bindings = [
        BufferBinding::new(0, &input_buffer),
        BufferBinding::new(1, &output_buffer),
        BufferBinding::new(2, &params_buffer),
    ];
    device
        .dispatch(&ComputeDispatch {
            pipeline: &pipeline,
            bindings: &bindings,
            workgroups: [workgroup_count(count, 64), 1, 1],
        })
        .unwrap();

    let output: Vec<u32> =
        bytemuck::pod_collect_to_vec(&device.read_buffer(&output_buffer, 0, 400).unwrap());
    let expected: Vec<u32> = input
        .iter()
        .map(|v| v * 3 + u32::from(add_one))
        .collect();
    assert_eq!(output, expected);
}

#[test]
fn test_scale_shader_composes_for_all_permutations() {
    let shader = scale_shader();
    let mut defines = ShaderDefines::new();
    shader.compose_wgsl(&defines).unwrap();
    defines.enable("ADD_ONE");
    shader.compose_wgsl(&defines).unwrap();
}
