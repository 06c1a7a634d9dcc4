use core::f32::consts::PI;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub x: f32,
    pub y: f32,
    /// Heading in radians, wrapped to (-pi, pi].
    pub theta: f32,
}

/// Dead reckoning from the chassis distance and angle packets.
#[derive(Debug, Default)]
pub struct Odometry {
    pose: Pose,
    total_distance_m: f32,
}

impl Odometry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold in one increment using the heading at the midpoint of the turn.
    pub fn integrate(&mut self, distance_mm: i32, angle_deg: i32) {
        if distance_mm == 0 && angle_deg == 0 {
            return;
        }
        let distance = distance_mm as f32 / 1000.0;
        let dtheta = (angle_deg as f32).to_radians();
        let heading = self.pose.theta + dtheta / 2.0;
        self.pose.x += distance * heading.cos();
        self.pose.y += distance * heading.sin();
        self.pose.theta = wrap_angle(self.pose.theta + dtheta);
        self.total_distance_m += distance.abs();
    }

    pub fn pose(&self) -> Pose {
        self.pose
    }

    pub fn total_distance_m(&self) -> f32 {
        self.total_distance_m
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

pub fn wrap_angle(theta: f32) -> f32 {
    let mut wrapped = theta % (2.0 * PI);
    if wrapped > PI {
        wrapped -= 2.0 * PI;
    } else if wrapped <= -PI {
        wrapped += 2.0 * PI;
    }
    wrapped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_straight_line() {
        let mut odom = Odometry::new();
        odom.integrate(500, 0);
        odom.integrate(500, 0);
        let pose = odom.pose();
        assert!((pose.x - 1.0).abs() < 1e-5);
        assert!(pose.y.abs() < 1e-5);
    }

    #[test]
    fn test_quarter_turn_in_place() {
        let mut odom = Odometry::new();
        odom.integrate(0, 90);
        assert!((odom.pose().theta - PI / 2.0).abs() < 1e-5);
        odom.integrate(1000, 0);
        assert!((odom.pose().y - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_heading_wraps() {
        let mut odom = Odometry::new();
        for _ in 0..3 {
            odom.integrate(0, 90);
        }
        assert!((odom.pose().theta + PI / 2.0).abs() < 1e-4);
    }
}
