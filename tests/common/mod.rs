#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use ghost::*;

pub const WAIT: Duration = Duration::from_secs(10);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Engine over a single host device.
pub fn host_engine() -> Engine {
    host_engine_with(EngineInfo {
        backends: vec![Backend::Cpu],
        ..Default::default()
    })
}

pub fn host_engine_with(info: EngineInfo) -> Engine {
    init_tracing();
    Engine::with_backends(
        &info,
        BackendTable::new().register(Arc::new(HostBackend::new().with_threads(2))),
    )
    .expect("host backend always reports a device")
}

/// Engine whose only "CUDA" devices are host-emulated, next to the host
/// backend itself.
pub fn emulated_cuda_engine(backends: Vec<Backend>, cuda_devices: usize) -> Result<Engine> {
    init_tracing();
    Engine::with_backends(
        &EngineInfo {
            backends,
            ..Default::default()
        },
        BackendTable::new()
            .register(Arc::new(HostBackend::new().with_threads(2)))
            .register(Arc::new(
                HostBackend::emulating(Backend::Cuda)
                    .with_device_count(cuda_devices)
                    .with_threads(2),
            )),
    )
}

pub fn first_device(engine: &Engine) -> Device {
    let id = engine.devices()[0].id;
    engine.open_device(id).expect("device opens")
}

/// Allocate a device-only block holding `values`.
pub fn upload<T: bytemuck::Pod>(device: &Device, values: &[T]) -> MemoryBlock {
    let host = HostBuffer::from_pod(values);
    let block = device
        .allocate(host.len() as u64, Residency::DeviceOnly)
        .expect("allocate");
    let mut stream = device.create_stream().expect("stream");
    stream.enqueue_copy(Transfer::upload(&host, block)).expect("enqueue upload");
    stream.submit().expect("submit").wait(WAIT).expect("upload completes");
    block
}

pub fn download<T: bytemuck::Pod>(device: &Device, block: MemoryBlock) -> Vec<T> {
    let host = HostBuffer::zeroed(block.size() as usize);
    let mut stream = device.create_stream().expect("stream");
    stream
        .enqueue_copy(Transfer::download(block, &host))
        .expect("enqueue download");
    stream.submit().expect("submit").wait(WAIT).expect("download completes");
    host.to_pod_vec()
}

pub const SCALE: &str = "
kernel scale(out: buffer<f32>, input: buffer<f32>, factor: f32) {
    let i = gid;
    if i < len(input) {
        out[i] = input[i] * factor;
    }
}
";

pub const ADD_ONE: &str = "
kernel add_one(data: buffer<u32>) {
    if gid < len(data) {
        data[gid] = data[gid] + 1;
    }
}
";

/// Every thread counts to `n` before writing the count.
pub const SPIN: &str = "
kernel spin(out: buffer<u32>, n: u32) {
    let acc = 0;
    for j in 0..n {
        acc = acc + 1;
    }
    if gid < len(out) {
        out[gid] = u32(acc);
    }
}
";
