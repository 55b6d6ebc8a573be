//! Inbound movement reports and outbound correction records.
//!
//! These are the decoded, protocol-agnostic shapes the host hands to a
//! [`Connection`](crate::Connection). Malformed packets are rejected by the host's
//! protocol layer before they get here.

use serde::{Deserialize, Serialize};

/// An absolute position in the world.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    /// X coordinate.
    pub x: f64,
    /// Y coordinate.
    pub y: f64,
    /// Z coordinate.
    pub z: f64,
}

impl Position {
    /// Creates a position.
    #[must_use]
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Squared euclidean distance to `other`.
    #[must_use]
    pub fn distance_squared(&self, other: &Self) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        dx * dx + dy * dy + dz * dz
    }

    /// True when every axis differs by less than `epsilon`.
    #[must_use]
    pub fn approx_eq(&self, other: &Self, epsilon: f64) -> bool {
        (self.x - other.x).abs() < epsilon
            && (self.y - other.y).abs() < epsilon
            && (self.z - other.z).abs() < epsilon
    }
}

/// A view direction in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rotation {
    /// Horizontal angle.
    pub yaw: f32,
    /// Vertical angle.
    pub pitch: f32,
}

impl Rotation {
    /// Creates a rotation.
    #[must_use]
    pub const fn new(yaw: f32, pitch: f32) -> Self {
        Self { yaw, pitch }
    }
}

/// Which duplicate-packet behavior a client exhibits, by protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClientEra {
    /// Before 1.17: only reports sent while riding a vehicle repeat.
    VehicleOnly,
    /// 1.17 to 1.18.1: repeats land within a coarse distance of the last claim.
    Coarse,
    /// 1.18.2 to 1.20.x: repeats land within a fine distance of the last claim.
    Fine,
    /// 1.21 and later: no duplicate artifact.
    Modern,
}

impl ClientEra {
    /// True when this era never sends the duplicate artifact.
    #[must_use]
    pub const fn is_modern(self) -> bool {
        matches!(self, Self::Modern)
    }
}

/// One decoded movement packet.
///
/// `position` and `rotation` are `None` when the packet did not carry that component.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MovementReport {
    /// The reported position, if the packet carried one.
    pub position: Option<Position>,
    /// The reported rotation, if the packet carried one.
    pub rotation: Option<Rotation>,
    /// The client's ground flag.
    pub on_ground: bool,
    /// Whether the player is riding a vehicle.
    pub in_vehicle: bool,
}

impl MovementReport {
    /// A packet carrying only a position.
    #[must_use]
    pub const fn position(position: Position, on_ground: bool) -> Self {
        Self {
            position: Some(position),
            rotation: None,
            on_ground,
            in_vehicle: false,
        }
    }

    /// A packet carrying only a rotation.
    #[must_use]
    pub const fn rotation(rotation: Rotation, on_ground: bool) -> Self {
        Self {
            position: None,
            rotation: Some(rotation),
            on_ground,
            in_vehicle: false,
        }
    }

    /// A packet carrying both components.
    #[must_use]
    pub const fn full(position: Position, rotation: Rotation, on_ground: bool) -> Self {
        Self {
            position: Some(position),
            rotation: Some(rotation),
            on_ground,
            in_vehicle: false,
        }
    }

    /// Marks the report as sent while riding a vehicle.
    #[must_use]
    pub const fn in_vehicle(mut self) -> Self {
        self.in_vehicle = true;
        self
    }
}

/// Per-axis "relative" flags of a teleport. A relative axis is an offset from the
/// client's current position rather than an absolute coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RelativeFlags {
    /// X is relative.
    pub x: bool,
    /// Y is relative.
    pub y: bool,
    /// Z is relative.
    pub z: bool,
}

impl RelativeFlags {
    /// Every axis absolute.
    pub const ABSOLUTE: Self = Self {
        x: false,
        y: false,
        z: false,
    };
}

/// A teleport the server sent and expects the client to echo.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PendingTeleport {
    /// Target coordinates (offsets on relative axes).
    pub target: Position,
    /// Which axes of `target` are relative.
    pub relative: RelativeFlags,
    /// Transaction after which the client has seen the teleport.
    pub transaction: u32,
}

impl PendingTeleport {
    /// The absolute position the client should report, given where it was.
    #[must_use]
    pub fn resolve(&self, current: Position) -> Position {
        Position {
            x: if self.relative.x {
                current.x + self.target.x
            } else {
                self.target.x
            },
            y: if self.relative.y {
                current.y + self.target.y
            } else {
                self.target.y
            },
            z: if self.relative.z {
                current.z + self.target.z
            } else {
                self.target.z
            },
        }
    }
}

/// A forced rotation the server sent and expects the client to echo.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PendingRotation {
    /// The rotation the client was forced to.
    pub target: Rotation,
    /// Transaction after which the client has seen the rotation.
    pub transaction: u32,
}

/// Either kind of outstanding correction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PendingCorrection {
    /// A position correction.
    Teleport(PendingTeleport),
    /// An orientation correction.
    ForcedRotation(PendingRotation),
}

impl PendingCorrection {
    /// Transaction the correction waits on.
    #[must_use]
    pub const fn transaction(&self) -> u32 {
        match self {
            Self::Teleport(t) => t.transaction,
            Self::ForcedRotation(r) => r.transaction,
        }
    }
}

/// Orientation change between two genuine reports.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RotationSample {
    /// Yaw change in degrees.
    pub delta_yaw: f32,
    /// Pitch change in degrees.
    pub delta_pitch: f32,
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn absolute_teleport_ignores_current_position() {
        let teleport = PendingTeleport {
            target: Position::new(10.0, 64.0, 10.0),
            relative: RelativeFlags::ABSOLUTE,
            transaction: 1,
        };
        assert_eq!(
            teleport.resolve(Position::new(-300.0, 12.0, 5.5)),
            Position::new(10.0, 64.0, 10.0)
        );
    }

    #[test]
    fn relative_axes_are_offsets() {
        let teleport = PendingTeleport {
            target: Position::new(1.0, 64.0, -2.0),
            relative: RelativeFlags {
                x: true,
                y: false,
                z: true,
            },
            transaction: 1,
        };
        assert_eq!(
            teleport.resolve(Position::new(100.0, 70.0, 50.0)),
            Position::new(101.0, 64.0, 48.0)
        );
    }

    #[test]
    fn approx_eq_is_per_axis() {
        let a = Position::new(1.0, 2.0, 3.0);
        assert!(a.approx_eq(&Position::new(1.0 + 5e-8, 2.0, 3.0 - 5e-8), 1e-7));
        assert!(!a.approx_eq(&Position::new(1.0, 2.0 + 2e-7, 3.0), 1e-7));
    }

    #[test]
    fn distance_squared() {
        let a = Position::new(0.0, 0.0, 0.0);
        assert_eq!(a.distance_squared(&Position::new(1.0, 2.0, 2.0)), 9.0);
    }

    #[test]
    fn only_modern_clients_lack_the_artifact() {
        assert!(ClientEra::Modern.is_modern());
        assert!(!ClientEra::Fine.is_modern());
        assert!(!ClientEra::Coarse.is_modern());
        assert!(!ClientEra::VehicleOnly.is_modern());
    }

    #[test]
    fn report_builders() {
        let report = MovementReport::full(Position::default(), Rotation::new(1.0, 2.0), true)
            .in_vehicle();
        assert!(report.position.is_some());
        assert!(report.rotation.is_some());
        assert!(report.on_ground);
        assert!(report.in_vehicle);

        assert!(MovementReport::rotation(Rotation::default(), false)
            .position
            .is_none());
    }
}
