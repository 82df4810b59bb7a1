mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use ghost::*;

#[test]
fn no_backend_reports_a_device() {
    init_tracing();
    let res = Engine::with_backends(
        &EngineInfo {
            backends: vec![Backend::Vulkan, Backend::Metal],
            ..Default::default()
        },
        BackendTable::new().register(Arc::new(HostBackend::new())),
    );
    assert!(matches!(res, Err(GPUError::NoBackendAvailable)));
}

#[test]
fn missing_backends_are_skipped() {
    let engine = emulated_cuda_engine(vec![Backend::Vulkan, Backend::Cuda], 2).unwrap();
    let devices = engine.list_devices();
    assert_eq!(devices.len(), 2);
    assert!(devices.iter().all(|d| d.backend == Backend::Cuda));
    assert_eq!(devices[0].id.index(), 0);
    assert_eq!(devices[1].id.index(), 1);
}

#[test]
fn devices_follow_preference_order() {
    let engine = emulated_cuda_engine(vec![Backend::Cpu, Backend::Cuda], 1).unwrap();
    let tags: Vec<_> = engine.devices().iter().map(|d| d.backend).collect();
    assert_eq!(tags, vec![Backend::Cpu, Backend::Cuda]);
}

#[test]
fn select_device_honours_filters() {
    let engine = emulated_cuda_engine(vec![Backend::Cpu, Backend::Cuda], 1).unwrap();

    let best = engine.select_device(&DeviceFilter::default()).unwrap();
    assert_eq!(best.descriptor().backend, Backend::Cuda);

    let cpu = engine
        .select_device(&DeviceFilter::default().add_required_backend(Backend::Cpu))
        .unwrap();
    assert_eq!(cpu.descriptor().kind, DeviceKind::Cpu);

    assert!(matches!(
        engine.select_device(&DeviceFilter::default().add_required_backend(Backend::Metal)),
        Err(GPUError::NotFound { kind: "device", .. })
    ));
}

#[test]
fn open_device_returns_the_same_device() {
    let engine = host_engine();
    let a = first_device(&engine);
    let b = first_device(&engine);
    let block = a.allocate(64, Residency::HostVisible).unwrap();
    b.write_mapped(&block, 0, &[1, 2, 3, 4]).unwrap();
    let mut out = [0u8; 4];
    a.read_mapped(&block, 0, &mut out).unwrap();
    assert_eq!(out, [1, 2, 3, 4]);
}

#[test]
fn freed_blocks_are_pooled_and_reused() {
    let engine = host_engine();
    let device = first_device(&engine);

    let block = device.allocate(1000, Residency::DeviceOnly).unwrap();
    device.free(block).unwrap();
    let stats = device.pool_stats().unwrap();
    assert_eq!(stats.live_blocks, 0);
    assert_eq!(stats.pooled_blocks, 1);
    assert_eq!(stats.pooled_bytes, 1024);

    let again = device.allocate(900, Residency::DeviceOnly).unwrap();
    let stats = device.pool_stats().unwrap();
    assert_eq!(stats.reused, 1);
    assert_eq!(stats.native_allocations, 1);
    assert_eq!(again.size(), 900);

    device.free(again).unwrap();
    assert_eq!(device.trim().unwrap(), 1024);
    assert_eq!(device.pool_stats().unwrap().pooled_bytes, 0);
}

#[test]
fn double_free_is_rejected() {
    let engine = host_engine();
    let device = first_device(&engine);
    let block = device.allocate(16, Residency::DeviceOnly).unwrap();
    device.free(block).unwrap();
    assert!(matches!(
        device.free(block),
        Err(GPUError::NotFound { kind: "memory block", .. })
    ));
}

#[test]
fn allocation_beyond_the_device_budget_fails() {
    init_tracing();
    let engine = Engine::with_backends(
        &EngineInfo::default(),
        BackendTable::new().register(Arc::new(HostBackend::new().with_memory_limit(4096))),
    )
    .unwrap();
    let device = first_device(&engine);

    let held = device.allocate(2048, Residency::DeviceOnly).unwrap();
    assert!(matches!(
        device.allocate(4096, Residency::DeviceOnly),
        Err(GPUError::OutOfMemory { requested: 4096, .. })
    ));

    // A pooled block is trimmed to make room.
    device.free(held).unwrap();
    assert!(device.allocate(4096, Residency::DeviceOnly).is_ok());
}

#[test]
fn mapped_access_needs_host_visible_memory() {
    let engine = host_engine();
    let device = first_device(&engine);

    let hidden = device.allocate(16, Residency::DeviceOnly).unwrap();
    assert!(matches!(
        device.write_mapped(&hidden, 0, &[0; 4]),
        Err(GPUError::NotHostVisible)
    ));

    let pinned = device.allocate(16, Residency::HostPinned).unwrap();
    assert!(matches!(
        device.write_mapped(&pinned, 14, &[0; 4]),
        Err(GPUError::OutOfRange { offset: 14, size: 4, len: 16 })
    ));
}

#[test]
fn stream_runs_operations_in_order() {
    let engine = host_engine();
    let device = first_device(&engine);
    let module = device.compile(&KernelSource::source(ADD_ONE)).unwrap();

    let data = device.allocate(16, Residency::DeviceOnly).unwrap();
    let host = HostBuffer::from_pod(&[1u32, 2, 3, 4]);
    let out = HostBuffer::zeroed(16);

    let mut stream = device.create_stream().unwrap();
    stream.enqueue_copy(Transfer::upload(&host, data)).unwrap();
    for _ in 0..3 {
        stream
            .enqueue_launch(&module, "add_one", LaunchShape::linear(4, 4), &[data.into()])
            .unwrap();
    }
    stream.enqueue_copy(Transfer::download(data, &out)).unwrap();
    assert_eq!(stream.pending_count(), 5);

    let fence = stream.submit().unwrap();
    fence.wait(WAIT).unwrap();
    assert!(fence.is_complete());
    assert_eq!(fence.poll().unwrap(), FenceStatus::Completed);
    assert_eq!(out.to_pod_vec::<u32>(), vec![4, 5, 6, 7]);
    assert_eq!(stream.pending_count(), 0);
}

#[test]
fn scale_kernel_uses_scalar_arguments() {
    let engine = host_engine();
    let device = first_device(&engine);
    let module = device.compile(&KernelSource::source(SCALE)).unwrap();

    let input: Vec<f32> = (0..100).map(|i| i as f32).collect();
    let src = upload(&device, &input);
    let dst = device.allocate(400, Residency::DeviceOnly).unwrap();

    let mut stream = device.create_stream().unwrap();
    stream
        .enqueue_launch(
            &module,
            "scale",
            LaunchShape::linear(100, 32),
            &[dst.into(), src.into(), 0.5f32.into()],
        )
        .unwrap();
    stream.submit().unwrap().wait(WAIT).unwrap();

    let out: Vec<f32> = download(&device, dst);
    let expected: Vec<f32> = input.iter().map(|v| v * 0.5).collect();
    assert_eq!(out, expected);
}

#[test]
fn barrier_orders_work_across_streams() {
    let engine = host_engine();
    let device = first_device(&engine);
    let spin = device.compile(&KernelSource::source(SPIN)).unwrap();
    let add = device.compile(&KernelSource::source(ADD_ONE)).unwrap();

    let data = device.allocate(64 * 4, Residency::DeviceOnly).unwrap();
    let out = HostBuffer::zeroed(64 * 4);

    let mut producer = device.create_stream().unwrap();
    producer
        .enqueue_launch(
            &spin,
            "spin",
            LaunchShape::linear(64, 16),
            &[data.into(), 20_000u32.into()],
        )
        .unwrap();
    let produced = producer.submit().unwrap();

    let mut consumer = device.create_stream().unwrap();
    consumer.enqueue_barrier(&[produced.clone()]).unwrap();
    consumer
        .enqueue_launch(&add, "add_one", LaunchShape::linear(64, 16), &[data.into()])
        .unwrap();
    consumer.enqueue_copy(Transfer::download(data, &out)).unwrap();
    let consumed = consumer.submit().unwrap();

    consumed.wait(WAIT).unwrap();
    assert!(produced.is_complete());
    assert!(out.to_pod_vec::<u32>().iter().all(|v| *v == 20_001));
}

#[test]
fn fence_wait_times_out() {
    let engine = host_engine();
    let device = first_device(&engine);
    let spin = device.compile(&KernelSource::source(SPIN)).unwrap();
    let data = device.allocate(64 * 4, Residency::DeviceOnly).unwrap();

    let mut stream = device.create_stream().unwrap();
    stream
        .enqueue_launch(
            &spin,
            "spin",
            LaunchShape::linear(64, 16),
            &[data.into(), 500_000u32.into()],
        )
        .unwrap();
    let fence = stream.submit().unwrap();
    assert!(matches!(
        fence.wait(Duration::from_millis(1)),
        Err(GPUError::TimedOut(_))
    ));
    fence.wait(Duration::from_secs(120)).unwrap();
}

#[test]
fn kernel_faults_fail_the_fence_and_stick() {
    let engine = host_engine();
    let device = first_device(&engine);
    let module = device
        .compile(&KernelSource::source(
            "kernel oob(o: buffer<u32>) { o[len(o)] = 1; }",
        ))
        .unwrap();
    let data = device.allocate(16, Residency::DeviceOnly).unwrap();

    let mut stream = device.create_stream().unwrap();
    stream
        .enqueue_launch(&module, "oob", LaunchShape::linear(1, 1), &[data.into()])
        .unwrap();
    let failed = stream.submit().unwrap();
    match failed.wait(WAIT) {
        Err(GPUError::DeviceFailure { backend, message }) => {
            assert_eq!(backend, Backend::Cpu);
            assert!(message.contains("kernel `oob`"), "{message}");
        }
        other => panic!("expected a device failure, got {other:?}"),
    }

    let host = HostBuffer::zeroed(16);
    stream.enqueue_copy(Transfer::download(data, &host)).unwrap();
    let later = stream.submit().unwrap();
    assert!(matches!(
        later.wait(WAIT),
        Err(GPUError::DeviceFailure { .. })
    ));

    // Other streams are unaffected.
    assert_eq!(download::<u32>(&device, data).len(), 4);
}

#[test]
fn launch_arguments_are_validated() {
    let engine = host_engine();
    let device = first_device(&engine);
    let module = device.compile(&KernelSource::source(SCALE)).unwrap();
    let a = device.allocate(16, Residency::DeviceOnly).unwrap();
    let b = device.allocate(16, Residency::DeviceOnly).unwrap();
    let shape = LaunchShape::linear(4, 4);
    let mut stream = device.create_stream().unwrap();

    assert!(matches!(
        stream.enqueue_launch(&module, "scale", shape, &[a.into(), b.into()]),
        Err(GPUError::ArgumentBinding { .. })
    ));
    match stream.enqueue_launch(&module, "scale", shape, &[a.into(), b.into(), 2u32.into()]) {
        Err(GPUError::ArgumentBinding { entry, message }) => {
            assert_eq!(entry, "scale");
            assert_eq!(message, "argument 2: expected f32, found u32");
        }
        other => panic!("expected a binding error, got {other:?}"),
    }
    assert!(matches!(
        stream.enqueue_launch(&module, "missing", shape, &[]),
        Err(GPUError::NotFound { kind: "entry point", .. })
    ));
    assert!(matches!(
        stream.enqueue_launch(
            &module,
            "scale",
            LaunchShape::new([1, 1, 1], [2048, 1, 1]),
            &[a.into(), b.into(), 1.0f32.into()]
        ),
        Err(GPUError::InvalidLaunchShape(_))
    ));
    assert!(matches!(
        stream.enqueue_launch(
            &module,
            "scale",
            LaunchShape::new([0, 1, 1], [1, 1, 1]),
            &[a.into(), b.into(), 1.0f32.into()]
        ),
        Err(GPUError::InvalidLaunchShape(_))
    ));
    assert_eq!(stream.pending_count(), 0);
}

#[test]
fn handles_are_scoped_to_their_device() {
    let engine = emulated_cuda_engine(vec![Backend::Cuda], 2).unwrap();
    let d0 = engine.open_device(engine.devices()[0].id).unwrap();
    let d1 = engine.open_device(engine.devices()[1].id).unwrap();

    let foreign = d1.allocate(16, Residency::DeviceOnly).unwrap();
    let local = d0.allocate(16, Residency::DeviceOnly).unwrap();
    let module = d0.compile(&KernelSource::source(ADD_ONE)).unwrap();
    let foreign_module = d1.compile(&KernelSource::source(ADD_ONE)).unwrap();

    let mut stream = d0.create_stream().unwrap();
    assert!(matches!(
        stream.enqueue_copy(Transfer::device(foreign, local, 16)),
        Err(GPUError::DeviceMismatch { .. })
    ));
    assert!(matches!(
        stream.enqueue_launch(&module, "add_one", LaunchShape::linear(4, 4), &[foreign.into()]),
        Err(GPUError::DeviceMismatch { .. })
    ));
    assert!(matches!(
        stream.enqueue_launch(&foreign_module, "add_one", LaunchShape::linear(4, 4), &[local.into()]),
        Err(GPUError::DeviceMismatch { .. })
    ));
    assert!(matches!(d0.free(foreign), Err(GPUError::DeviceMismatch { .. })));
}

#[test]
fn copy_between_devices_is_staged() {
    let engine = emulated_cuda_engine(vec![Backend::Cuda, Backend::Cpu], 1).unwrap();
    let cuda = engine.open_device(engine.devices()[0].id).unwrap();
    let cpu = engine.open_device(engine.devices()[1].id).unwrap();
    assert_ne!(cuda.descriptor().backend, cpu.descriptor().backend);

    let src = upload(&cuda, &[10u32, 20, 30, 40]);
    let dst = cpu.allocate(16, Residency::DeviceOnly).unwrap();

    let fence = cuda.copy(&src, &dst, 8, 4, 8).unwrap();
    assert_eq!(fence.device(), cpu.id());
    fence.wait(WAIT).unwrap();
    assert_eq!(download::<u32>(&cpu, dst), vec![0, 0, 20, 30]);

    let same = cpu.allocate(16, Residency::DeviceOnly).unwrap();
    engine.copy(&dst, &same, 16, 0, 0).unwrap().wait(WAIT).unwrap();
    assert_eq!(download::<u32>(&cpu, same), vec![0, 0, 20, 30]);
    cpu.synchronize(WAIT).unwrap();
}

#[test]
fn oversized_cross_device_copy_is_rejected() {
    let engine = emulated_cuda_engine(vec![Backend::Cuda], 2).unwrap();
    let d0 = engine.open_device(engine.devices()[0].id).unwrap();
    let d1 = engine.open_device(engine.devices()[1].id).unwrap();
    let a = d0.allocate(16, Residency::DeviceOnly).unwrap();
    let b = d1.allocate(16, Residency::DeviceOnly).unwrap();

    assert!(matches!(
        d0.copy(&a, &b, u64::MAX, 0, 0),
        Err(GPUError::OutOfRange { size: u64::MAX, .. })
    ));
    assert!(matches!(
        engine.copy(&a, &b, 8, 0, 12),
        Err(GPUError::OutOfRange { offset: 12, size: 8, len: 16 })
    ));
    d0.copy(&a, &b, 16, 0, 0).unwrap().wait(WAIT).unwrap();
}

#[test]
fn unaligned_transfers_round_trip() {
    let engine = host_engine();
    let device = first_device(&engine);
    let mut stream = device.create_stream().unwrap();

    for size in [1u64, 3, 255, 257, 4097] {
        let bytes: Vec<u8> = (0..size + 5).map(|i| (i % 251) as u8 + 1).collect();
        let src = HostBuffer::from_bytes(&bytes);
        let out = HostBuffer::zeroed(size as usize + 2);
        let block = device.allocate(size + 3, Residency::DeviceOnly).unwrap();

        stream
            .enqueue_copy(Transfer::upload(&src, block).with_offsets(5, 3).with_size(size))
            .unwrap();
        stream
            .enqueue_copy(Transfer::download(block, &out).with_offsets(3, 2).with_size(size))
            .unwrap();
        stream.submit().unwrap().wait(WAIT).unwrap();

        let out = out.to_vec();
        assert_eq!(&out[..2], &[0, 0], "size {size}");
        assert_eq!(&out[2..], &bytes[5..], "size {size}");
        device.free(block).unwrap();
    }
}

#[test]
fn freed_block_in_use_by_queued_work_is_not_handed_out() {
    let engine = host_engine();
    let device = first_device(&engine);
    let module = device
        .compile(&KernelSource::source(
            "kernel slow_fill(out: buffer<u32>, n: u32) {
                if gid == 0 {
                    let acc = 0;
                    for j in 0..n {
                        acc = acc + 1;
                    }
                    for i in 0..len(out) {
                        out[i] = 42;
                    }
                }
            }",
        ))
        .unwrap();

    let a = device.allocate(256, Residency::HostVisible).unwrap();
    let mut stream = device.create_stream().unwrap();
    stream
        .enqueue_launch(
            &module,
            "slow_fill",
            LaunchShape::linear(1, 1),
            &[a.into(), 2_000_000u32.into()],
        )
        .unwrap();
    let fence = stream.submit().unwrap();
    device.free(a).unwrap();

    let b = device.allocate(256, Residency::HostVisible).unwrap();
    device.write_mapped(&b, 0, &[0; 256]).unwrap();
    fence.wait(WAIT).unwrap();

    let mut out = [0xffu8; 256];
    device.read_mapped(&b, 0, &mut out).unwrap();
    assert!(out.iter().all(|&v| v == 0));
}

#[test]
fn compiled_modules_are_cached() {
    let engine = host_engine();
    let device = first_device(&engine);

    let a = device.compile(&KernelSource::source(ADD_ONE)).unwrap();
    let b = device.compile(&KernelSource::source(ADD_ONE)).unwrap();
    assert_eq!(a.id(), b.id());

    let c = device
        .compile(&KernelSource::source(ADD_ONE).with_options("-O2"))
        .unwrap();
    assert_ne!(a.id(), c.id());

    let stats = device.cache_stats().unwrap();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 2);
    assert_eq!(stats.resident, 2);

    device.unload(&a).unwrap();
    assert_eq!(device.cache_stats().unwrap().resident, 1);
    let d = device.compile(&KernelSource::source(ADD_ONE)).unwrap();
    assert_ne!(a.id(), d.id());
}

#[test]
fn binaries_are_checked_against_the_device() {
    let engine = host_engine();
    let device = first_device(&engine);

    let ok = device
        .compile(&KernelSource::binary(&package(Backend::Cpu, ADD_ONE.as_bytes())))
        .unwrap();
    assert!(ok.entry_point("add_one").is_some());

    assert!(matches!(
        device.compile(&KernelSource::binary(&package(Backend::Cuda, ADD_ONE.as_bytes()))),
        Err(GPUError::BackendMismatch {
            expected: Backend::Cpu,
            found: Backend::Cuda
        })
    ));
    let spirv = 0x0723_0203u32.to_le_bytes();
    assert!(matches!(
        device.compile(&KernelSource::binary(&spirv)),
        Err(GPUError::BackendMismatch {
            found: Backend::Vulkan,
            ..
        })
    ));

    let data = device.allocate(16, Residency::DeviceOnly).unwrap();
    let mut stream = device.create_stream().unwrap();
    stream
        .enqueue_launch(&ok, "add_one", LaunchShape::linear(4, 4), &[data.into()])
        .unwrap();
    let streams = device.streams().unwrap();
    let cached = device.cache_stats().unwrap().resident;
    assert!(matches!(
        device.compile(&KernelSource::source("kernel broken(")),
        Err(GPUError::CompileError { .. })
    ));
    assert_eq!(device.streams().unwrap(), streams);
    assert_eq!(device.cache_stats().unwrap().resident, cached);
    assert_eq!(stream.pending_count(), 1);
    stream.submit().unwrap().wait(WAIT).unwrap();
    assert_eq!(download::<u32>(&device, data), vec![1; 4]);
}

#[test]
fn streams_are_listed_until_dropped() {
    let engine = host_engine();
    let device = first_device(&engine);

    let a = device.create_stream().unwrap();
    let b = device.create_stream().unwrap();
    assert_ne!(a.id(), b.id());
    let listed = device.streams().unwrap();
    assert!(listed.contains(&a.id()) && listed.contains(&b.id()));

    let gone = a.id();
    drop(a);
    assert!(!device.streams().unwrap().contains(&gone));
}

#[test]
fn shutdown_drains_and_invalidates_handles() {
    let engine = host_engine();
    let device = first_device(&engine);
    let module = device.compile(&KernelSource::source(ADD_ONE)).unwrap();
    let data = upload(&device, &[0u32; 16]);

    let mut stream = device.create_stream().unwrap();
    stream
        .enqueue_launch(&module, "add_one", LaunchShape::linear(16, 16), &[data.into()])
        .unwrap();
    let fence = stream.submit().unwrap();

    let report = engine.shutdown();
    assert!(report.drained_cleanly);
    assert_eq!(report.aborted_operation_count, 0);
    assert!(fence.is_complete());

    assert!(matches!(device.allocate(16, Residency::DeviceOnly), Err(GPUError::ShutDown)));
    assert!(matches!(device.create_stream(), Err(GPUError::ShutDown)));
    assert!(matches!(stream.submit(), Err(GPUError::ShutDown)));
    assert!(matches!(
        engine.open_device(device.id()),
        Err(GPUError::ShutDown)
    ));

    assert_eq!(engine.shutdown(), ShutdownReport {
        drained_cleanly: true,
        aborted_operation_count: 0,
    });
}

#[test]
fn shutdown_aborts_work_past_the_grace_period() {
    let engine = host_engine_with(EngineInfo {
        backends: vec![Backend::Cpu],
        shutdown_grace: Duration::from_millis(20),
        ..Default::default()
    });
    let device = first_device(&engine);
    let spin = device.compile(&KernelSource::source(SPIN)).unwrap();
    let data = device.allocate(64 * 64 * 4, Residency::DeviceOnly).unwrap();

    let mut stream = device.create_stream().unwrap();
    let mut fences = Vec::new();
    for _ in 0..3 {
        stream
            .enqueue_launch(
                &spin,
                "spin",
                LaunchShape::linear(64 * 64, 64),
                &[data.into(), 100_000u32.into()],
            )
            .unwrap();
        fences.push(stream.submit().unwrap());
    }

    let report = engine.shutdown();
    assert!(!report.drained_cleanly);
    assert!(report.aborted_operation_count >= 1);
    assert!(matches!(
        fences[2].wait(Duration::ZERO),
        Err(GPUError::DeviceFailure { .. })
    ));
}
