use glam::{Mat4, Vec3, Vec4};

/// Axis-aligned bounds in mesh space: center and half-extents.
#[derive(Debug, Clone, Copy)]
pub struct Bounds {
    pub origin: Vec3,
    pub extent: Vec3,
}

/// Conservative frustum test: projects the eight corners of the bounds
/// through the combined view-projection-model matrix and rejects the draw
/// only when the projected box lies entirely outside clip space.
pub fn is_visible(bounds: &Bounds, matrix: Mat4) -> bool {
    const CORNERS: [Vec3; 8] = [
        Vec3::new(1.0, 1.0, 1.0),
        Vec3::new(1.0, 1.0, -1.0),
        Vec3::new(1.0, -1.0, 1.0),
        Vec3::new(1.0, -1.0, -1.0),
        Vec3::new(-1.0, 1.0, 1.0),
        Vec3::new(-1.0, 1.0, -1.0),
        Vec3::new(-1.0, -1.0, 1.0),
        Vec3::new(-1.0, -1.0, -1.0),
    ];

    let mut min = Vec3::splat(1.5);
    let mut max = Vec3::splat(-1.5);

    for corner in CORNERS {
        let world = bounds.origin + corner * bounds.extent;
        let clip = matrix * Vec4::new(world.x, world.y, world.z, 1.0);
        let projected = clip.truncate() / clip.w;
        min = min.min(projected);
        max = max.max(projected);
    }

    !(min.z > 1.0 || max.z < 0.0 || min.x > 1.0 || max.x < -1.0 || min.y > 1.0 || max.y < -1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_bounds() -> Bounds {
        Bounds {
            origin: Vec3::ZERO,
            extent: Vec3::ONE,
        }
    }

    fn test_view_proj() -> Mat4 {
        let proj = Mat4::perspective_rh(70f32.to_radians(), 16.0 / 9.0, 0.1, 1000.0);
        let view = Mat4::look_at_rh(Vec3::new(0.0, 0.0, 10.0), Vec3::ZERO, Vec3::Y);
        proj * view
    }

    #[test]
    fn box_in_front_of_camera_is_visible() {
        assert!(is_visible(&unit_bounds(), test_view_proj()));
    }

    #[test]
    fn box_behind_camera_is_culled() {
        let matrix = test_view_proj() * Mat4::from_translation(Vec3::new(0.0, 0.0, 100.0));
        assert!(!is_visible(&unit_bounds(), matrix));
    }

    #[test]
    fn box_far_off_to_the_side_is_culled() {
        let matrix = test_view_proj() * Mat4::from_translation(Vec3::new(500.0, 0.0, 0.0));
        assert!(!is_visible(&unit_bounds(), matrix));
    }

    #[test]
    fn large_box_surrounding_the_camera_is_visible() {
        let bounds = Bounds {
            origin: Vec3::ZERO,
            extent: Vec3::splat(100.0),
        };
        assert!(is_visible(&bounds, test_view_proj()));
    }

    #[test]
    fn offset_origin_is_respected() {
        let bounds = Bounds {
            origin: Vec3::new(500.0, 0.0, 0.0),
            extent: Vec3::ONE,
        };
        assert!(!is_visible(&bounds, test_view_proj()));
    }
}
