//! Conversions between wire matrices and `cgmath`.

use cgmath::{Matrix4, Quaternion, Vector3};

use crate::protocol::Matrix;

/// Wire (column-major `[f32; 16]`) to `cgmath`.
pub fn to_mat4(m: &Matrix) -> Matrix4<f32> {
    Matrix4::new(
        m[0], m[1], m[2], m[3], //
        m[4], m[5], m[6], m[7], //
        m[8], m[9], m[10], m[11], //
        m[12], m[13], m[14], m[15],
    )
}

/// `cgmath` to wire.
pub fn from_mat4(m: Matrix4<f32>) -> Matrix {
    let cols: [[f32; 4]; 4] = m.into();
    let mut out = [0.0f32; 16];
    for (i, col) in cols.iter().enumerate() {
        out[i * 4..i * 4 + 4].copy_from_slice(col);
    }
    out
}

/// `a * b`.
pub fn multiply(a: &Matrix, b: &Matrix) -> Matrix {
    from_mat4(to_mat4(a) * to_mat4(b))
}

/// Rigid transform from an orientation quaternion `(x, y, z, w)` and a
/// position. The quaternion is normalised; a zero quaternion yields pure
/// translation.
pub fn pose(orientation: [f32; 4], position: [f32; 3]) -> Matrix {
    let [x, y, z, w] = orientation;
    let q = Quaternion::new(w, x, y, z);
    let norm = (w * w + x * x + y * y + z * z).sqrt();
    let rotation = if norm > f32::EPSILON {
        Matrix4::from(q * (1.0 / norm))
    } else {
        Matrix4::from_scale(1.0)
    };
    let translation = Matrix4::from_translation(Vector3::from(position));
    from_mat4(translation * rotation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::IDENTITY;

    fn approx(a: &Matrix, b: &Matrix) -> bool {
        a.iter().zip(b).all(|(x, y)| (x - y).abs() < 1e-5)
    }

    #[test]
    fn test_conversion_is_column_major() {
        let t = from_mat4(Matrix4::from_translation(Vector3::new(1.0, 2.0, 3.0)));
        assert_eq!(&t[12..15], &[1.0, 2.0, 3.0]);
        assert_eq!(to_mat4(&t), Matrix4::from_translation(Vector3::new(1.0, 2.0, 3.0)));
    }

    #[test]
    fn test_identity_multiply() {
        let t = from_mat4(Matrix4::from_nonuniform_scale(2.0, 3.0, 4.0));
        assert!(approx(&multiply(&IDENTITY, &t), &t));
        assert!(approx(&multiply(&t, &IDENTITY), &t));
    }

    #[test]
    fn test_pose_identity_quaternion() {
        let m = pose([0.0, 0.0, 0.0, 1.0], [0.5, 1.5, -2.0]);
        let mut expected = IDENTITY;
        expected[12] = 0.5;
        expected[13] = 1.5;
        expected[14] = -2.0;
        assert!(approx(&m, &expected));
    }

    #[test]
    fn test_pose_normalises_quaternion() {
        let a = pose([0.0, 0.0, 0.0, 2.0], [0.0; 3]);
        assert!(approx(&a, &IDENTITY));
        let zero = pose([0.0; 4], [0.0; 3]);
        assert!(approx(&zero, &IDENTITY));
    }
}
