mod common;

use common::*;
use ghost::*;

fn run(device: &Device, src: &str, entry: &str, shape: LaunchShape, args: &[Argument]) -> Result<()> {
    let module = device.compile(&KernelSource::source(src))?;
    let mut stream = device.create_stream()?;
    stream.enqueue_launch(&module, entry, shape, args)?;
    stream.submit()?.wait(WAIT)
}

#[test]
fn planar_launch_sees_two_dimensional_ids() {
    let engine = host_engine();
    let device = first_device(&engine);
    let out = device.allocate(32 * 4, Residency::DeviceOnly).unwrap();

    run(
        &device,
        "kernel grid(out: buffer<u32>) {
            let w = gsize_x;
            out[gid_y * w + gid_x] = gid_y * 100 + gid_x;
        }",
        "grid",
        LaunchShape::planar([8, 4], [4, 2]),
        &[out.into()],
    )
    .unwrap();

    let expected: Vec<u32> = (0..4).flat_map(|y| (0..8).map(move |x| y * 100 + x)).collect();
    assert_eq!(download::<u32>(&device, out), expected);
}

#[test]
fn loops_and_intrinsics() {
    let engine = host_engine();
    let device = first_device(&engine);
    let input = upload(&device, &[-4.0f32, 1.0, 9.0, 2.0]);
    let out = device.allocate(16, Residency::DeviceOnly).unwrap();

    run(
        &device,
        "kernel stats(out: buffer<f32>, input: buffer<f32>) {
            if gid == 0 {
                let lo = input[0];
                let hi = input[0];
                let sum = 0.0;
                for i in 0..len(input) {
                    lo = min(lo, input[i]);
                    hi = max(hi, input[i]);
                    sum = sum + input[i];
                }
                out[0] = lo;
                out[1] = hi;
                out[2] = sum;
                out[3] = sqrt(abs(lo));
            }
        }",
        "stats",
        LaunchShape::linear(1, 1),
        &[out.into(), input.into()],
    )
    .unwrap();

    assert_eq!(download::<f32>(&device, out), vec![-4.0, 9.0, 8.0, 2.0]);
}

#[test]
fn casts_truncate_toward_zero() {
    let engine = host_engine();
    let device = first_device(&engine);
    let input = upload(&device, &[1.9f32, -2.5, 10.0]);
    let out = device.allocate(12, Residency::DeviceOnly).unwrap();

    run(
        &device,
        "kernel conv(out: buffer<i32>, input: buffer<f32>) {
            if gid < len(input) {
                out[gid] = i32(input[gid]) - 3;
            }
        }",
        "conv",
        LaunchShape::linear(3, 4),
        &[out.into(), input.into()],
    )
    .unwrap();

    assert_eq!(download::<i32>(&device, out), vec![-2, -5, 7]);
}

#[test]
fn bool_scalars_drive_branches() {
    let engine = host_engine();
    let device = first_device(&engine);
    let src = "kernel pick(out: buffer<u32>, flag: bool) {
        if flag { out[gid] = 1; } else { out[gid] = 2; }
    }";
    let out = device.allocate(16, Residency::DeviceOnly).unwrap();

    run(&device, src, "pick", LaunchShape::linear(4, 4), &[out.into(), true.into()]).unwrap();
    assert_eq!(download::<u32>(&device, out), vec![1; 4]);

    run(&device, src, "pick", LaunchShape::linear(4, 4), &[out.into(), false.into()]).unwrap();
    assert_eq!(download::<u32>(&device, out), vec![2; 4]);
}

#[test]
fn integer_division_by_zero_faults() {
    let engine = host_engine();
    let device = first_device(&engine);
    let out = device.allocate(4, Residency::DeviceOnly).unwrap();

    let err = run(
        &device,
        "kernel div(out: buffer<i32>, d: i32) { out[0] = 10 / d; }",
        "div",
        LaunchShape::linear(1, 1),
        &[out.into(), 0i32.into()],
    )
    .unwrap_err();
    match err {
        GPUError::DeviceFailure { message, .. } => {
            assert!(message.contains("integer division by zero"), "{message}")
        }
        other => panic!("expected a device failure, got {other:?}"),
    }
}

#[test]
fn compile_errors_are_reported_with_locations() {
    let engine = host_engine();
    let device = first_device(&engine);

    match device.compile(&KernelSource::source("kernel k(o: buffer<f32>) {\n  o[0] = true;\n}")) {
        Err(GPUError::CompileError { backend, diagnostics }) => {
            assert_eq!(backend, Backend::Cpu);
            assert!(diagnostics.starts_with("2:10: error: mismatched types"), "{diagnostics}");
        }
        other => panic!("expected a compile error, got {other:?}"),
    }

    match device.compile(&KernelSource::source(ADD_ONE).with_options("--fast")) {
        Err(GPUError::CompileError { diagnostics, .. }) => {
            assert_eq!(diagnostics, "unknown compiler option `--fast`")
        }
        other => panic!("expected a compile error, got {other:?}"),
    }
    assert_eq!(device.cache_stats().unwrap().resident, 0);
}

#[test]
fn deeply_nested_source_is_a_compile_error() {
    let engine = host_engine();
    let device = first_device(&engine);

    let depth = 200_000;
    let src = format!(
        "kernel k(o: buffer<u32>) {{\n  o[0] = {}1{};\n}}",
        "(".repeat(depth),
        ")".repeat(depth)
    );
    match device.compile(&KernelSource::source(&src)) {
        Err(GPUError::CompileError { diagnostics, .. }) => {
            let first = diagnostics.lines().next().unwrap_or_default();
            assert!(first.starts_with("2:"), "{first}");
            assert!(first.ends_with("error: expression nested too deeply"), "{first}");
        }
        other => panic!("expected a compile error, got {other:?}"),
    }
    assert!(device.compile(&KernelSource::source(ADD_ONE)).is_ok());
}

#[test]
fn modules_report_their_signatures() {
    let engine = host_engine();
    let device = first_device(&engine);
    let module = device.compile(&KernelSource::source(SCALE)).unwrap();

    assert_eq!(module.backend(), Backend::Cpu);
    assert_eq!(module.device(), device.id());
    assert_eq!(
        module.entry_points(),
        &[EntryPoint::new(
            "scale",
            &[
                ParamKind::Buffer,
                ParamKind::Buffer,
                ParamKind::Scalar(ScalarType::F32)
            ]
        )]
    );

    let declared = KernelSource::source(SCALE).with_entry_point(EntryPoint::new(
        "scale",
        &[ParamKind::Buffer, ParamKind::Buffer, ParamKind::Scalar(ScalarType::I32)],
    ));
    assert!(matches!(
        device.compile(&declared),
        Err(GPUError::CompileError { .. })
    ));
}
