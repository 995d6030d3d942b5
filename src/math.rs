pub fn norm(x: mint::Vector3<f32>) -> f32 {
    dot(x, x).sqrt()
}

pub fn dot(x: mint::Vector3<f32>, y: mint::Vector3<f32>) -> f32 {
    x.x * y.x + x.y * y.y + x.z * y.z
}

/// Unit vector pointing from the origin towards `p`, or zero when `p` is at
/// the origin
pub fn direction_to(p: mint::Point3<f32>) -> mint::Vector3<f32> {
    let v = mint::Vector3::from([p.x, p.y, p.z]);
    let len = norm(v);
    if len > 1e-6 {
        [v.x / len, v.y / len, v.z / len].into()
    } else {
        [0.0; 3].into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_direction() {
        let d = direction_to([3.0, 0.0, -4.0].into());
        assert!((norm(d) - 1.0).abs() < 1e-6);
        assert!((d.x - 0.6).abs() < 1e-6);
        assert!((d.z + 0.8).abs() < 1e-6);
    }

    #[test]
    fn origin_direction_is_zero() {
        let d = direction_to([0.0; 3].into());
        assert_eq!(norm(d), 0.0);
    }
}
