use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ProtoError;

/// Subscribable topic. The request verb is the key the server expects in the
/// REQUEST payload (`{ "<verb>": "subscribe" }`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    Alarms,
    Events,
    Instance,
    Links,
    Processor,
    Management,
    CommandQueues,
    Parameter,
    Time,
    CommandHistory,
}

impl Topic {
    pub const ALL: [Topic; 10] = [
        Topic::Alarms,
        Topic::Events,
        Topic::Instance,
        Topic::Links,
        Topic::Processor,
        Topic::Management,
        Topic::CommandQueues,
        Topic::Parameter,
        Topic::Time,
        Topic::CommandHistory,
    ];

    pub fn verb(self) -> &'static str {
        match self {
            Topic::Alarms => "alarms",
            Topic::Events => "events",
            Topic::Instance => "instance",
            Topic::Links => "links",
            Topic::Processor => "processor",
            Topic::Management => "management",
            Topic::CommandQueues => "cqueues",
            Topic::Parameter => "parameter",
            Topic::Time => "time",
            Topic::CommandHistory => "cmdhistory",
        }
    }

    /// Topics whose DATA frames carry a `subscriptionId` so several
    /// subscriptions of the same topic can coexist on one connection.
    pub fn is_parallel(self) -> bool {
        matches!(self, Topic::Parameter)
    }

    pub fn data_kinds(self) -> &'static [DataKind] {
        match self {
            Topic::Alarms => &[DataKind::AlarmData],
            Topic::Events => &[DataKind::Event],
            Topic::Instance => &[DataKind::Instance],
            Topic::Links => &[DataKind::LinkEvent],
            Topic::Processor => &[DataKind::ProcessorInfo],
            Topic::Management => &[DataKind::ClientInfo, DataKind::ProcessingStatistics],
            Topic::CommandQueues => &[DataKind::CommandQueueInfo, DataKind::CommandQueueEvent],
            Topic::Parameter => &[DataKind::Parameter],
            Topic::Time => &[DataKind::TimeInfo],
            Topic::CommandHistory => &[DataKind::CommandHistory],
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.verb())
    }
}

/// Discriminator (`dt`) of a DATA payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataKind {
    ConnectionInfo,
    AlarmData,
    Event,
    Instance,
    LinkEvent,
    ProcessorInfo,
    ClientInfo,
    ProcessingStatistics,
    CommandQueueInfo,
    CommandQueueEvent,
    Parameter,
    TimeInfo,
    CommandHistory,
}

impl DataKind {
    pub fn as_wire(self) -> &'static str {
        match self {
            DataKind::ConnectionInfo => "CONNECTION_INFO",
            DataKind::AlarmData => "ALARM_DATA",
            DataKind::Event => "EVENT",
            DataKind::Instance => "INSTANCE",
            DataKind::LinkEvent => "LINK_EVENT",
            DataKind::ProcessorInfo => "PROCESSOR_INFO",
            DataKind::ClientInfo => "CLIENT_INFO",
            DataKind::ProcessingStatistics => "PROCESSING_STATISTICS",
            DataKind::CommandQueueInfo => "COMMAND_QUEUE_INFO",
            DataKind::CommandQueueEvent => "COMMAND_QUEUE_EVENT",
            DataKind::Parameter => "PARAMETER",
            DataKind::TimeInfo => "TIME_INFO",
            DataKind::CommandHistory => "CMD_HISTORY",
        }
    }

    pub fn from_wire(dt: &str) -> Result<Self, ProtoError> {
        let kind = match dt {
            "CONNECTION_INFO" => DataKind::ConnectionInfo,
            "ALARM_DATA" => DataKind::AlarmData,
            "EVENT" => DataKind::Event,
            "INSTANCE" => DataKind::Instance,
            "LINK_EVENT" => DataKind::LinkEvent,
            "PROCESSOR_INFO" => DataKind::ProcessorInfo,
            "CLIENT_INFO" => DataKind::ClientInfo,
            "PROCESSING_STATISTICS" => DataKind::ProcessingStatistics,
            "COMMAND_QUEUE_INFO" => DataKind::CommandQueueInfo,
            "COMMAND_QUEUE_EVENT" => DataKind::CommandQueueEvent,
            "PARAMETER" => DataKind::Parameter,
            "TIME_INFO" => DataKind::TimeInfo,
            "CMD_HISTORY" => DataKind::CommandHistory,
            other => return Err(ProtoError::UnknownDataType(other.to_string())),
        };
        Ok(kind)
    }

    /// Owning topic. `None` for the connection bootstrap frame, which every
    /// client receives without subscribing.
    pub fn topic(self) -> Option<Topic> {
        match self {
            DataKind::ConnectionInfo => None,
            DataKind::AlarmData => Some(Topic::Alarms),
            DataKind::Event => Some(Topic::Events),
            DataKind::Instance => Some(Topic::Instance),
            DataKind::LinkEvent => Some(Topic::Links),
            DataKind::ProcessorInfo => Some(Topic::Processor),
            DataKind::ClientInfo | DataKind::ProcessingStatistics => Some(Topic::Management),
            DataKind::CommandQueueInfo | DataKind::CommandQueueEvent => {
                Some(Topic::CommandQueues)
            }
            DataKind::Parameter => Some(Topic::Parameter),
            DataKind::TimeInfo => Some(Topic::Time),
            DataKind::CommandHistory => Some(Topic::CommandHistory),
        }
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_wire())
    }
}
