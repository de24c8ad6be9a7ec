use glam::{Mat4, Vec3};
use photometric::renderer::cull::is_visible;
use photometric::renderer::Bounds;

fn unit_cube() -> Bounds {
    Bounds {
        origin: Vec3::ZERO,
        extent: Vec3::ONE,
    }
}

#[test]
fn unit_cube_through_identity_is_visible() {
    assert!(is_visible(&unit_cube(), Mat4::IDENTITY));
}

#[test]
fn cube_pushed_past_the_far_plane_is_culled() {
    let matrix = Mat4::from_translation(Vec3::new(0.0, 0.0, 100.0));
    assert!(!is_visible(&unit_cube(), matrix));
}

#[test]
fn cube_straddling_the_near_plane_is_visible() {
    let proj = Mat4::perspective_rh(60f32.to_radians(), 1.0, 0.1, 100.0);
    let view = Mat4::look_at_rh(Vec3::new(0.0, 0.0, 0.5), Vec3::NEG_Z, Vec3::Y);
    assert!(is_visible(&unit_cube(), proj * view));
}

#[test]
fn scaled_transform_expands_the_tested_volume() {
    let proj = Mat4::perspective_rh(60f32.to_radians(), 1.0, 0.1, 1000.0);
    let view = Mat4::look_at_rh(Vec3::new(0.0, 0.0, 50.0), Vec3::ZERO, Vec3::Y);
    let view_proj = proj * view;

    // Off to the side at unit scale, but a large scale brings it into view.
    let offset = Mat4::from_translation(Vec3::new(40.0, 0.0, 0.0));
    assert!(!is_visible(&unit_cube(), view_proj * offset));

    let scaled = offset * Mat4::from_scale(Vec3::splat(45.0));
    assert!(is_visible(&unit_cube(), view_proj * scaled));
}
