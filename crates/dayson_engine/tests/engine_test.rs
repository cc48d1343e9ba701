//! Math engine properties: numeric discipline under adversarial input,
//! the seeded end-to-end op scenarios, and host/device parity where an
//! adapter is available.

use std::sync::Arc;

use dayson_engine::engine::{DeviceEngine, HostEngine, MathEngine};
use dayson_engine::{GpuContext, Tensor};

fn try_device() -> Option<DeviceEngine> {
    let ctx = GpuContext::try_new()?;
    match DeviceEngine::new(ctx) {
        Ok(engine) => Some(engine),
        Err(e) => {
            eprintln!("device engine unavailable, skipping: {}", e);
            None
        }
    }
}

// S1: embedding lookup + scatter-add round trip.
#[test]
fn lookup_and_scatter_add() {
    let e = HostEngine::new();
    let table = e
        .create_from(
            &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0, 11.0, 12.0],
            &[4, 3],
        )
        .unwrap();

    let mut row = e.create(&[1, 3]).unwrap();
    e.lookup(&table, 2, &mut row).unwrap();
    assert_eq!(row.to_host().unwrap().data(), &[7.0, 8.0, 9.0]);

    let mut grad = e.create(&[4, 3]).unwrap();
    let update = e.create_from(&[0.5, 0.5, 0.5], &[1, 3]).unwrap();
    e.accumulate_gradient(&mut grad, &update, 2).unwrap();
    let g = grad.to_host().unwrap();
    assert_eq!(&g.data()[6..9], &[0.5, 0.5, 0.5]);
    assert!(g.data()[..6].iter().all(|&v| v == 0.0));
    assert!(g.data()[9..].iter().all(|&v| v == 0.0));
}

// S2: softmax stability on large and poisoned rows.
#[test]
fn softmax_stability() {
    let e = HostEngine::new();

    let x = e.create_from(&[1000.0, 1001.0, 1002.0], &[1, 3]).unwrap();
    let mut out = e.create(&[1, 3]).unwrap();
    e.softmax(&x, &mut out).unwrap();
    let p = out.to_host().unwrap();
    let expected = [0.0900, 0.2447, 0.6652];
    for (got, want) in p.data().iter().zip(expected) {
        assert!((got - want).abs() < 1e-4, "got {:?}", p.data());
    }

    // NaN cannot be uploaded through create_from; build the host tensor
    // directly, the way a poisoned kernel output would look.
    let poisoned = Tensor::Host(
        dayson_engine::HostTensor::from_vec(vec![f32::NAN, 1.0, 1.0], &[1, 3]).unwrap(),
    );
    let mut out = e.create(&[1, 3]).unwrap();
    e.softmax(&poisoned, &mut out).unwrap();
    let p = out.to_host().unwrap();
    let sum: f32 = p.data().iter().sum();
    assert!((sum - 1.0).abs() < 1e-5);
    assert!(p.data().iter().all(|v| v.is_finite()));
    assert!((p.data()[1] - 0.5).abs() < 1e-4);
}

// T6: rows sum to one and stay inside [1e-10, 1].
#[test]
fn softmax_rows_are_distributions() {
    let e = HostEngine::new();
    let x = e
        .create_from(
            &[0.0, -5.0, 3.0, 100.0, -100.0, 0.0, 1e30, -1e30, 2.0],
            &[3, 3],
        )
        .unwrap();
    let mut out = e.create(&[3, 3]).unwrap();
    e.softmax(&x, &mut out).unwrap();
    for row in out.to_host().unwrap().data().chunks_exact(3) {
        let sum: f32 = row.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5, "row {:?}", row);
        assert!(row.iter().all(|&v| (1e-10..=1.0).contains(&v)));
    }
}

// T5: adversarial inputs never leak NaN/Inf out of any activation.
#[test]
fn activations_absorb_adversarial_inputs() {
    let e = HostEngine::new();
    let adversarial = Tensor::Host(
        dayson_engine::HostTensor::from_vec(
            vec![f32::NAN, f32::INFINITY, f32::NEG_INFINITY, 1e30, -1e30, 0.0],
            &[1, 6],
        )
        .unwrap(),
    );

    let mut out = e.create(&[1, 6]).unwrap();
    e.sigmoid(&adversarial, &mut out).unwrap();
    let s = out.to_host().unwrap();
    assert!(s.data().iter().all(|v| v.is_finite() && (0.0..=1.0).contains(v)));
    assert_eq!(s.data()[0], 0.5);

    let mut out = e.create(&[1, 6]).unwrap();
    e.tanh(&adversarial, &mut out).unwrap();
    let t = out.to_host().unwrap();
    assert!(t.data().iter().all(|v| v.is_finite() && (-1.0..=1.0).contains(v)));
    assert_eq!(t.data()[0], 0.0);

    let mut out = e.create(&[1, 6]).unwrap();
    e.sigmoid_deriv(&adversarial, &mut out).unwrap();
    assert!(out
        .to_host()
        .unwrap()
        .data()
        .iter()
        .all(|v| (0.0..=0.25).contains(v)));

    let mut out = e.create(&[1, 6]).unwrap();
    e.tanh_deriv(&adversarial, &mut out).unwrap();
    assert!(out
        .to_host()
        .unwrap()
        .data()
        .iter()
        .all(|v| (0.0..=1.0).contains(v)));

    let mut x = adversarial;
    e.sanitize_and_clip(&mut x, 0.005).unwrap();
    let clean = x.to_host().unwrap();
    assert!(clean.data().iter().all(|v| v.abs() <= 0.005));
    assert_eq!(clean.data()[0], 0.0);
}

// S3: one Adam step with the reference numbers.
#[test]
fn adam_single_step() {
    let e = HostEngine::new();
    let mut p = e.create_from(&[1.0], &[1]).unwrap();
    let g = e.create_from(&[0.1], &[1]).unwrap();
    let mut m = e.create(&[1]).unwrap();
    let mut v = e.create(&[1]).unwrap();

    e.adam_update(&mut p, &g, &mut m, &mut v, 0.01, 0.9, 0.999, 1e-8, 1)
        .unwrap();

    let p = p.to_host().unwrap();
    assert!((p.data()[0] - 0.99).abs() < 1e-4, "p = {}", p.data()[0]);
    let m = m.to_host().unwrap();
    assert!((m.data()[0] - 0.01).abs() < 1e-7);
    let v = v.to_host().unwrap();
    assert!((v.data()[0] - 0.00001).abs() < 1e-9);
}

// T7: under constant gradient the moments converge to g and g².
#[test]
fn adam_moments_converge() {
    let e = HostEngine::new();
    let g_val = 0.05f32;
    let mut p = e.create_from(&[2.0], &[1]).unwrap();
    let g = e.create_from(&[g_val], &[1]).unwrap();
    let mut m = e.create(&[1]).unwrap();
    let mut v = e.create(&[1]).unwrap();

    for t in 1..=10_000 {
        e.adam_update(&mut p, &g, &mut m, &mut v, 1e-4, 0.9, 0.999, 1e-8, t)
            .unwrap();
    }

    let m = m.to_host().unwrap().data()[0];
    let v = v.to_host().unwrap().data()[0];
    assert!((m - g_val).abs() / g_val < 1e-3, "m = {}", m);
    assert!(
        (v - g_val * g_val).abs() / (g_val * g_val) < 1e-3,
        "v = {}",
        v
    );
}

#[test]
fn sum_of_squares_has_f64_headroom() {
    let e = HostEngine::new();
    let x = e.create_from(&vec![1e4f32; 10_000], &[100, 100]).unwrap();
    let total = e.sum_of_squares(&x).unwrap();
    assert!((total - 1e12).abs() / 1e12 < 1e-6);
}

#[test]
fn clip_and_scale_in_place() {
    let e = HostEngine::new();
    let mut x = e.create_from(&[-3.0, -0.5, 0.0, 0.5, 3.0], &[5]).unwrap();
    e.clip(&mut x, -1.0, 1.0).unwrap();
    assert_eq!(x.to_host().unwrap().data(), &[-1.0, -0.5, 0.0, 0.5, 1.0]);
    e.scale(&mut x, 2.0).unwrap();
    assert_eq!(x.to_host().unwrap().data(), &[-2.0, -1.0, 0.0, 1.0, 2.0]);
}

#[test]
fn one_hot_rows() {
    let e = HostEngine::new();
    let t = e.one_hot(&[2, 0], 4).unwrap();
    assert_eq!(t.shape(), &[2, 4]);
    assert_eq!(
        t.to_host().unwrap().data(),
        &[0.0, 0.0, 1.0, 0.0, 1.0, 0.0, 0.0, 0.0]
    );
    assert!(e.one_hot(&[4], 4).is_err());
}

// ----------------------------------------------------------------------
// Device parity (skipped when no adapter is present)
// ----------------------------------------------------------------------

fn assert_parity(host_out: &[f32], device_out: &[f32], tol: f32, what: &str) {
    assert_eq!(host_out.len(), device_out.len(), "{} lengths", what);
    for (i, (h, d)) in host_out.iter().zip(device_out).enumerate() {
        assert!(
            (h - d).abs() <= tol,
            "{}[{}]: host {} vs device {}",
            what,
            i,
            h,
            d
        );
    }
}

#[test]
fn device_matches_host_on_core_ops() {
    let device = match try_device() {
        Some(d) => d,
        None => {
            eprintln!("no compute adapter, skipping");
            return;
        }
    };
    let host = HostEngine::new();

    let a_data: Vec<f32> = (0..6 * 5).map(|i| ((i * 7) % 13) as f32 * 0.25 - 1.0).collect();
    let b_data: Vec<f32> = (0..5 * 4).map(|i| ((i * 11) % 17) as f32 * 0.125 - 1.0).collect();

    // matmul
    let (ah, bh) = (
        host.create_from(&a_data, &[6, 5]).unwrap(),
        host.create_from(&b_data, &[5, 4]).unwrap(),
    );
    let mut ch = host.create(&[6, 4]).unwrap();
    host.matmul(&ah, &bh, &mut ch).unwrap();

    let (ad, bd) = (
        device.create_from(&a_data, &[6, 5]).unwrap(),
        device.create_from(&b_data, &[5, 4]).unwrap(),
    );
    let mut cd = device.create(&[6, 4]).unwrap();
    device.matmul(&ad, &bd, &mut cd).unwrap();
    assert_parity(
        ch.to_host().unwrap().data(),
        cd.to_host().unwrap().data(),
        1e-4,
        "matmul",
    );

    // softmax
    let rows: Vec<f32> = (0..3 * 7).map(|i| (i as f32 * 0.37).sin() * 4.0).collect();
    let xh = host.create_from(&rows, &[3, 7]).unwrap();
    let mut sh = host.create(&[3, 7]).unwrap();
    host.softmax(&xh, &mut sh).unwrap();
    let xd = device.create_from(&rows, &[3, 7]).unwrap();
    let mut sd = device.create(&[3, 7]).unwrap();
    device.softmax(&xd, &mut sd).unwrap();
    assert_parity(
        sh.to_host().unwrap().data(),
        sd.to_host().unwrap().data(),
        1e-5,
        "softmax",
    );

    // adam
    let p0: Vec<f32> = (0..32).map(|i| i as f32 * 0.1).collect();
    let g0: Vec<f32> = (0..32).map(|i| ((i % 5) as f32 - 2.0) * 0.01).collect();
    let mut ph = host.create_from(&p0, &[32]).unwrap();
    let gh = host.create_from(&g0, &[32]).unwrap();
    let mut mh = host.create(&[32]).unwrap();
    let mut vh = host.create(&[32]).unwrap();
    host.adam_update(&mut ph, &gh, &mut mh, &mut vh, 0.01, 0.9, 0.999, 1e-8, 1)
        .unwrap();

    let mut pd = device.create_from(&p0, &[32]).unwrap();
    let gd = device.create_from(&g0, &[32]).unwrap();
    let mut md = device.create(&[32]).unwrap();
    let mut vd = device.create(&[32]).unwrap();
    device
        .adam_update(&mut pd, &gd, &mut md, &mut vd, 0.01, 0.9, 0.999, 1e-8, 1)
        .unwrap();
    assert_parity(
        ph.to_host().unwrap().data(),
        pd.to_host().unwrap().data(),
        1e-5,
        "adam p",
    );

    // sum of squares through the workgroup reduction
    let big: Vec<f32> = (0..5000).map(|i| ((i % 97) as f32 - 48.0) * 0.01).collect();
    let xh = host.create_from(&big, &[5000]).unwrap();
    let xd = device.create_from(&big, &[5000]).unwrap();
    let sh = host.sum_of_squares(&xh).unwrap();
    let sd = device.sum_of_squares(&xd).unwrap();
    assert!((sh - sd).abs() / sh.max(1e-12) < 1e-4, "sos {} vs {}", sh, sd);
}

// T3: a released device tensor must refuse further use, loudly.
#[test]
fn released_device_tensor_panics_on_use() {
    let device = match try_device() {
        Some(d) => d,
        None => {
            eprintln!("no compute adapter, skipping");
            return;
        }
    };
    let mut t = device.create_from(&[1.0, 2.0], &[2]).unwrap();
    if let Tensor::Device(d) = &mut t {
        d.release();
        assert!(d.is_released());
    } else {
        panic!("device engine produced a host tensor");
    }
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        let _ = t.to_host();
    }));
    assert!(result.is_err(), "use after release must panic");
}

#[test]
fn sync_markers_complete_within_deadline() {
    let device = match try_device() {
        Some(d) => d,
        None => {
            eprintln!("no compute adapter, skipping");
            return;
        }
    };
    // Queue some real work, then prove the marker observes its completion.
    let a = device.create_from(&vec![1.0f32; 1024], &[32, 32]).unwrap();
    let b = device.create_from(&vec![2.0f32; 1024], &[32, 32]).unwrap();
    let mut c = device.create(&[32, 32]).unwrap();
    device.matmul(&a, &b, &mut c).unwrap();

    let guard = device.sync_guard().expect("device engine has a sync guard");
    let marker = guard.insert_marker("test_marker");
    let done = guard
        .wait_event(&marker, "test_wait", std::time::Duration::from_secs(30))
        .unwrap();
    assert!(done, "marker did not complete");
    assert_eq!(c.to_host().unwrap().data()[0], 64.0);
}

#[test]
fn device_round_trip_upload_download() {
    let device = match try_device() {
        Some(d) => d,
        None => {
            eprintln!("no compute adapter, skipping");
            return;
        }
    };
    let engine: Arc<dyn MathEngine> = Arc::new(device);
    let data: Vec<f32> = (0..257).map(|i| i as f32 * 0.5 - 64.0).collect();
    let t = engine.create_from(&data, &[257]).unwrap();
    assert_eq!(engine.download(&t).unwrap().data(), data.as_slice());
}
