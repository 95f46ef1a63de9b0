use std::{collections::HashMap, net::IpAddr};

use serde::{Deserialize, Serialize};

/// Per-robot output limits applied by the drive-packet generator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RobotLimits {
    pub steer: f32,
    pub forward: f32,
    pub weapon: f32,
    /// Weapon can spin both ways.
    pub bidirectional: bool,
}

impl Default for RobotLimits {
    fn default() -> Self {
        Self {
            steer: 1.0,
            forward: 1.0,
            weapon: 1.0,
            bidirectional: false,
        }
    }
}

/// Network address and channel tuning for one registered robot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobotInfo {
    pub id: u32,
    pub ip: IpAddr,
    pub port: u16,
    /// Inverts the corresponding drive channel.
    #[serde(default)]
    pub inverted: [bool; 4],
    #[serde(default)]
    pub limits: RobotLimits,
}

/// Lookup of registered robots by id.
pub trait RobotDirectory: Send + Sync {
    fn robot_info(&self, id: u32) -> Option<RobotInfo>;

    fn robots(&self) -> Vec<RobotInfo>;
}

/// Directory backed by the robots listed in the configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticRobotDirectory {
    robots: HashMap<u32, RobotInfo>,
}

impl StaticRobotDirectory {
    pub fn new(robots: impl IntoIterator<Item = RobotInfo>) -> Self {
        Self {
            robots: robots.into_iter().map(|robot| (robot.id, robot)).collect(),
        }
    }
}

impl RobotDirectory for StaticRobotDirectory {
    fn robot_info(&self, id: u32) -> Option<RobotInfo> {
        self.robots.get(&id).cloned()
    }

    fn robots(&self) -> Vec<RobotInfo> {
        let mut robots: Vec<_> = self.robots.values().cloned().collect();
        robots.sort_by_key(|robot| robot.id);
        robots
    }
}
