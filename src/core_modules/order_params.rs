// THEORY:
// Order parameters describe the herd as a whole rather than cell by cell. They are
// computed over every agent pixel of the step, regardless of grid cells.
//
// - Polarization is the mean of unit motion vectors. 1 means every pixel moves the
//   same way, 0 means directions cancel out.
// - Pseudo-angular-momentum is the mean normalized z-component of ρ × v, where ρ is
//   a pixel's offset from this step's masked-pixel centroid. It is close to ±1 for a
//   herd milling around its own center and close to 0 for a translating herd. It is
//   a rotational-alignment indicator, not a physical momentum: there is no mass and
//   the reference point moves with the herd.
// - Average speed is the mean motion magnitude in ground units per second.
//
// Positions are pixel coordinates and motion is pixels per frame; only the average
// speed depends on the scale.

use crate::core_modules::agent_mask::AgentMask;
use crate::core_modules::motion_field::MotionField;

/// Keeps the normalized cross product finite for pixels at the centroid or at rest.
pub const ANGULAR_MOMENTUM_EPSILON: f64 = 1e-5;

/// Collective-order measures of one step.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct OrderParameters {
    /// Mean unit motion vector.
    pub polarization: [f64; 2],
    /// Mean normalized z-component of (r − centroid) × v.
    pub angular_momentum: f64,
    /// Mean motion magnitude, ground units per second.
    pub average_speed: f64,
    /// Number of agent pixels the measures were taken over.
    pub sample_count: u64,
}

impl OrderParameters {
    pub fn polarization_magnitude(&self) -> f64 {
        self.polarization[0].hypot(self.polarization[1])
    }

    pub fn angular_momentum_magnitude(&self) -> f64 {
        self.angular_momentum.abs()
    }

    /// Computes the order parameters over every agent pixel covered by `field`.
    pub fn compute(mask: &AgentMask, field: &MotionField, body_length: f64, frame_time: f64) -> Self {
        let samples: Vec<([f64; 2], [f64; 2])> = mask
            .iter_agents()
            .filter(|(x, y)| *x < field.width() && *y < field.height())
            .map(|(x, y)| {
                let flow = field.get(x, y);
                ([x as f64, y as f64], [flow[0] as f64, flow[1] as f64])
            })
            .collect();

        if samples.is_empty() {
            return Self::default();
        }
        let n = samples.len() as f64;

        let mut centroid = [0.0, 0.0];
        for (position, _) in &samples {
            centroid[0] += position[0];
            centroid[1] += position[1];
        }
        centroid[0] /= n;
        centroid[1] /= n;

        let mut polarization = [0.0, 0.0];
        let mut angular_momentum = 0.0;
        let mut speed_sum = 0.0;

        for (position, velocity) in &samples {
            let speed = velocity[0].hypot(velocity[1]);
            speed_sum += speed;
            if speed > 0.0 {
                polarization[0] += velocity[0] / speed;
                polarization[1] += velocity[1] / speed;
            }

            let rho = [position[0] - centroid[0], position[1] - centroid[1]];
            let cross = rho[0] * velocity[1] - rho[1] * velocity[0];
            angular_momentum += cross / (rho[0].hypot(rho[1]) * speed + ANGULAR_MOMENTUM_EPSILON);
        }

        Self {
            polarization: [polarization[0] / n, polarization[1] / n],
            angular_momentum: angular_momentum / n,
            average_speed: speed_sum / n / body_length / frame_time,
            sample_count: samples.len() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mask_of(width: u32, height: u32, points: &[(u32, u32)]) -> AgentMask {
        let mut pixels = vec![false; (width * height) as usize];
        for (x, y) in points {
            pixels[(y * width + x) as usize] = true;
        }
        AgentMask::from_pixels(width, height, pixels)
    }

    #[test]
    fn orthogonal_unit_vectors_half_polarize() {
        let mask = mask_of(2, 1, &[(0, 0), (1, 0)]);
        let mut field = MotionField::zeros(2, 1);
        field.set(0, 0, [1.0, 0.0]);
        field.set(1, 0, [0.0, 1.0]);

        let order = OrderParameters::compute(&mask, &field, 1.0, 1.0);
        assert!((order.polarization[0] - 0.5).abs() < 1e-12);
        assert!((order.polarization[1] - 0.5).abs() < 1e-12);
        assert!((order.polarization_magnitude() - 0.5f64.sqrt()).abs() < 1e-4);
    }

    #[test]
    fn single_pixel_average_speed_in_ground_units() {
        let mask = mask_of(3, 3, &[(1, 1)]);
        let field = MotionField::uniform(3, 3, [5.0, 0.0]);
        let order = OrderParameters::compute(&mask, &field, 10.0, 0.1);
        assert!((order.average_speed - 5.0).abs() < 1e-12);
        assert!((order.polarization_magnitude() - 1.0).abs() < 1e-12);
        // A lone pixel sits on its own centroid.
        assert_eq!(order.angular_momentum, 0.0);
    }

    #[test]
    fn rotation_about_the_centroid_has_unit_angular_momentum() {
        // Four pixels around (2, 2), each moving counter-clockwise in image coordinates.
        let mask = mask_of(5, 5, &[(3, 2), (2, 3), (1, 2), (2, 1)]);
        let mut field = MotionField::zeros(5, 5);
        field.set(3, 2, [0.0, 1.0]);
        field.set(2, 3, [-1.0, 0.0]);
        field.set(1, 2, [0.0, -1.0]);
        field.set(2, 1, [1.0, 0.0]);

        let order = OrderParameters::compute(&mask, &field, 1.0, 1.0);
        assert!((order.angular_momentum - 1.0).abs() < 1e-4);
        assert!(order.polarization_magnitude() < 1e-12);
    }

    #[test]
    fn translation_has_no_angular_momentum() {
        let mask = mask_of(5, 5, &[(0, 0), (4, 0), (0, 4), (4, 4)]);
        let field = MotionField::uniform(5, 5, [2.0, 0.0]);
        let order = OrderParameters::compute(&mask, &field, 1.0, 1.0);
        assert!(order.angular_momentum.abs() < 1e-9);
        assert!((order.polarization_magnitude() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn empty_mask_yields_zeros() {
        let order = OrderParameters::compute(&mask_of(2, 2, &[]), &MotionField::zeros(2, 2), 1.0, 1.0);
        assert_eq!(order, OrderParameters::default());
    }

    #[test]
    fn polarization_stays_bounded_with_resting_pixels() {
        let mask = mask_of(3, 1, &[(0, 0), (1, 0), (2, 0)]);
        let mut field = MotionField::zeros(3, 1);
        field.set(0, 0, [3.0, 4.0]);
        field.set(1, 0, [-0.5, 7.0]);

        let order = OrderParameters::compute(&mask, &field, 1.0, 1.0);
        let magnitude = order.polarization_magnitude();
        assert!((0.0..=1.0).contains(&magnitude));
    }
}
