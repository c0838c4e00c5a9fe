use aslkit_core::transform::{combine_warps, compose_rigid, invert_rigid, RigidTransform, WarpField};
use aslkit_core::{CoreError, Grid, Header, Space};
use burn_ndarray::NdArray;
use nalgebra::Point3;
use proptest::prelude::*;

type Backend = NdArray<f32>;

fn grid() -> Grid {
    Grid::new(Header::from_spacing([1.0, 1.0, 1.0]).unwrap(), [8, 8, 8])
}

/// Warp whose components are computed from the voxel's world position.
fn warp_from(f: impl Fn(Point3<f64>) -> [f64; 3]) -> WarpField<Backend> {
    let device = Default::default();
    let grid = grid();
    let [nz, ny, nx] = grid.shape();
    let mut components = [Vec::new(), Vec::new(), Vec::new()];
    for z in 0..nz {
        for y in 0..ny {
            for x in 0..nx {
                let world = grid
                    .header()
                    .index_to_world(&Point3::new(x as f64, y as f64, z as f64));
                let d = f(world);
                for k in 0..3 {
                    components[k].push(d[k] as f32);
                }
            }
        }
    }
    WarpField::from_components(components, &grid, Space::NativeAsl, Space::NativeAsl, &device).unwrap()
}

fn rows(warp: &WarpField<Backend>) -> Vec<f32> {
    warp.displacement_rows().into_data().to_vec::<f32>().unwrap()
}

fn interior(n: usize) -> bool {
    let (x, y, z) = (n % 8, (n / 8) % 8, n / 64);
    [x, y, z].iter().all(|c| (2..6).contains(c))
}

#[test]
fn test_warp_order_is_preserved() {
    let device = Default::default();
    let shift = warp_from(|_| [1.0, 0.0, 0.0]);
    let shear = warp_from(|p| [0.0, 0.1 * p.x, 0.0]);

    let forward = combine_warps(&[shift.clone(), shear.clone()], None, &grid(), &device).unwrap();
    let reverse = combine_warps(&[shear, shift], None, &grid(), &device).unwrap();

    let a = rows(&forward.warp);
    let b = rows(&reverse.warp);
    for n in (0..512).filter(|n| interior(*n)) {
        let x = (n % 8) as f32;
        // [shift, shear]: shear first, then shift
        assert!((a[3 * n] - 1.0).abs() < 1e-4);
        assert!((a[3 * n + 1] - 0.1 * x).abs() < 1e-4);
        // [shear, shift]: shift first, then shear evaluated at x + 1
        assert!((b[3 * n + 1] - 0.1 * (x + 1.0)).abs() < 1e-4);
    }

    // Both compositions preserve volume.
    let ja = forward.jacobian.to_vec().unwrap();
    let jb = reverse.jacobian.to_vec().unwrap();
    for n in (0..512).filter(|n| interior(*n)) {
        assert!((ja[n] - 1.0).abs() < 1e-4);
        assert!((jb[n] - 1.0).abs() < 1e-4);
    }
}

#[test]
fn test_jacobian_is_product_of_scalings() {
    let device = Default::default();
    let centre = 3.5;
    let stretch_x = warp_from(|p| [0.1 * (p.x - centre), 0.0, 0.0]);
    let stretch_y = warp_from(|p| [0.0, 0.2 * (p.y - centre), 0.0]);
    let postmat = RigidTransform::from_translation([0.5, 0.0, 0.0], Space::NativeAsl, Space::Structural);

    let combined = combine_warps(&[stretch_x, stretch_y], Some(&postmat), &grid(), &device).unwrap();
    assert_eq!(combined.warp.destination(), &Space::Structural);

    let jac = combined.jacobian.to_vec().unwrap();
    let interior: Vec<f32> = (0..512).filter(|n| interior(*n)).map(|n| jac[n]).collect();
    let mean = interior.iter().sum::<f32>() / interior.len() as f32;
    assert!((mean - 1.1 * 1.2).abs() < 1e-3, "mean jacobian {mean}");
}

#[test]
fn test_postmat_space_must_follow_last_warp() {
    let device = Default::default();
    let warp = warp_from(|_| [0.0; 3]);
    let postmat = RigidTransform::identity(Space::Structural, Space::NativeAsl);
    let result = combine_warps(&[warp], Some(&postmat), &grid(), &device);
    assert!(matches!(result, Err(CoreError::SpaceMismatch { .. })));
}

proptest! {
    #[test]
    fn test_rigid_inverse_composes_to_identity(
        ax in -1.0f64..1.0, ay in -1.0f64..1.0, az in -1.0f64..1.0,
        tx in -20.0f64..20.0, ty in -20.0f64..20.0, tz in -20.0f64..20.0
    ) {
        let t = RigidTransform::from_euler([ax, ay, az], [tx, ty, tz], [0.0; 3], Space::NativeAsl, Space::Calibration);
        let inv = invert_rigid(&t).unwrap();
        let round = compose_rigid(&t, &inv).unwrap();
        prop_assert_eq!(round.source(), &Space::NativeAsl);
        prop_assert_eq!(round.destination(), &Space::NativeAsl);
        prop_assert!(round.is_identity(1e-9));
    }

    #[test]
    fn test_composition_is_associative(
        a in -1.0f64..1.0, b in -1.0f64..1.0, t in -10.0f64..10.0
    ) {
        let r1 = RigidTransform::from_euler([a, 0.0, 0.0], [t, 0.0, 0.0], [0.0; 3], Space::NativeAsl, Space::Calibration);
        let r2 = RigidTransform::from_euler([0.0, b, 0.0], [0.0, t, 0.0], [1.0; 3], Space::Calibration, Space::Structural);
        let r3 = RigidTransform::from_euler([0.0, 0.0, a], [0.0, 0.0, t], [0.0; 3], Space::Structural, Space::Standard);
        let left = compose_rigid(&compose_rigid(&r1, &r2).unwrap(), &r3).unwrap();
        let right = compose_rigid(&r1, &compose_rigid(&r2, &r3).unwrap()).unwrap();
        prop_assert!((left.matrix() - right.matrix()).abs().max() < 1e-9);
    }
}
