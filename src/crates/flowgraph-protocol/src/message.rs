//! Control-plane message sum type.
//!
//! Master, agents, executors and graph clients all speak this one enum; the
//! receiver dispatches on the decoded variant. The declaration order is the
//! wire tag and must stay stable.

use crate::resource::Resource;
use crate::task::{Solution, TaskId, TaskInfo};
use crate::topology::Topology;
use crate::Key;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which half of a duplex channel an I/O condition applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    In,
    Out,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::In => write!(f, "in"),
            Direction::Out => write!(f, "out"),
        }
    }
}

/// Order an agent to tear down one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KillTask {
    pub task_id: TaskId,
}

/// An I/O failure or end-of-file observed on a stream.
///
/// Routed to the affected stream's callback before the stream deregisters;
/// `errno` carries the originating OS error (EPIPE for peer EOF).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokenIo {
    pub direction: Direction,
    pub errno: i32,
}

impl BrokenIo {
    pub fn new(direction: Direction, errno: i32) -> Self {
        Self { direction, errno }
    }
}

impl fmt::Display for BrokenIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "broken {} stream (errno {})", self.direction, self.errno)
    }
}

/// Periodic load report an agent sends the master.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LoadInfo {
    /// One-minute load average of the agent host.
    pub cpu_load: f64,
}

/// Every control message on the wire. Variant order is the wire tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    KillTask(KillTask),
    BrokenIo(BrokenIo),
    Topology(Topology),
    Resource(Resource),
    LoadInfo(LoadInfo),
    TaskInfo(TaskInfo),
    Solution(Solution),
}

/// First frame on a freshly accepted frontier socket: names the stream whose
/// inter-container half the socket will carry from now on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrontierPacket {
    pub graph: Key,
    pub stream: Key,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode_frame, encode_frame};
    use crate::task::ExitStatus;
    use crate::topology::{StreamSpec, VertexSpec};

    fn round_trip(message: Message) {
        let frame = encode_frame(&message).unwrap();
        let (back, used): (Message, usize) = decode_frame(&frame).unwrap().unwrap();
        assert_eq!(back, message);
        assert_eq!(used, frame.len());
    }

    #[test]
    fn every_variant_round_trips() {
        round_trip(Message::KillTask(KillTask {
            task_id: TaskId::new(1, 2),
        }));
        round_trip(Message::BrokenIo(BrokenIo::new(Direction::In, 32)));

        let mut topology = Topology::new(4, crate::NONE_KEY);
        topology.vertices.insert(0, VertexSpec { key: 0, container: 0 });
        topology.streams.insert(7, StreamSpec { key: 7, tail: 0, head: 1 });
        round_trip(Message::Topology(topology));

        let mut resource = Resource::new(8, 1 << 30, 1 << 33);
        resource.host = "node1:6000".to_string();
        round_trip(Message::Resource(resource));

        round_trip(Message::LoadInfo(LoadInfo { cpu_load: 0.75 }));
        round_trip(Message::TaskInfo(TaskInfo::new(
            TaskId::new(4, 0),
            "node1",
            ExitStatus::Exited(0),
        )));

        let mut solution = Solution::new(4);
        solution.taskinfos.push(TaskInfo::new(
            TaskId::new(4, 0),
            "node1",
            ExitStatus::Signaled(9),
        ));
        round_trip(Message::Solution(solution));
    }

    #[test]
    fn frontier_packet_round_trips() {
        let packet = FrontierPacket { graph: 3, stream: 12 };
        let frame = encode_frame(&packet).unwrap();
        let (back, _): (FrontierPacket, usize) = decode_frame(&frame).unwrap().unwrap();
        assert_eq!(back, packet);
    }
}
