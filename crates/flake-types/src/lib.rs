use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Longest name (in bytes) kept for a process or watchdog token.
pub const MAX_NAME_LEN: usize = 31;

/// Truncate `name` to [`MAX_NAME_LEN`] bytes without splitting a character.
pub fn bounded_name(name: &str) -> String {
    if name.len() <= MAX_NAME_LEN {
        return name.to_string();
    }
    let mut end = MAX_NAME_LEN;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    name[..end].to_string()
}

macro_rules! kernel_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u32);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl FromStr for $name {
            type Err = KernelError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.trim().parse::<u32>().map($name).map_err(|_| {
                    KernelError::InvalidParam(format!(
                        "'{s}' is not a valid {}",
                        stringify!($name)
                    ))
                })
            }
        }
    };
}

kernel_id!(
    /// Process identifier. Monotonically increasing for the registry's lifetime.
    Pid
);
kernel_id!(
    /// Identifier of a watchdog token.
    WatchdogId
);
kernel_id!(
    /// Identifier of a scheduled timer.
    TimerId
);
kernel_id!(
    /// Identifier of a message queue.
    QueueId
);
kernel_id!(
    /// Sequence number stamped on every sent or broadcast message.
    MessageId
);
kernel_id!(
    /// Identifier of an event subscription.
    SubscriptionId
);
kernel_id!(
    /// Identifier of a registered resource.
    ResourceId
);

/// Scheduling priority class of a process.
///
/// Ordered from least to most urgent; [`Priority::substrate_level`] maps the
/// class onto the thread substrate's numeric range while preserving order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Idle,
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    /// Numeric priority handed to the underlying substrate (`1..=5`).
    pub fn substrate_level(self) -> u8 {
        self as u8 + 1
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Priority::Idle => "idle",
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Critical => "critical",
        };
        f.pad(s)
    }
}

impl FromStr for Priority {
    type Err = KernelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "idle" => Ok(Priority::Idle),
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            other => Err(KernelError::InvalidParam(format!(
                "unknown priority '{other}'"
            ))),
        }
    }
}

/// Lifecycle state of a process record.
///
/// `Created -> Ready -> Running <-> Blocked`, and any non-terminal state may
/// move to `Terminated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Created,
    Ready,
    Running,
    Blocked,
    Terminated,
}

impl ProcessState {
    pub fn is_terminal(self) -> bool {
        self == ProcessState::Terminated
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProcessState::Created => "CREATED",
            ProcessState::Ready => "READY",
            ProcessState::Running => "RUNNING",
            ProcessState::Blocked => "BLOCKED",
            ProcessState::Terminated => "TERMINATED",
        };
        f.pad(s)
    }
}

/// Classification tag of a watchdog token. Carries no behavior in the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchdogKind {
    #[default]
    Task,
    Interrupt,
    System,
}

impl fmt::Display for WatchdogKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WatchdogKind::Task => "task",
            WatchdogKind::Interrupt => "interrupt",
            WatchdogKind::System => "system",
        };
        f.pad(s)
    }
}

/// Reason code passed to the fatal-failure escalation path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PanicReason {
    StackOverflow,
    MemoryCorruption,
    WatchdogTimeout,
    AssertionFailed,
    UserAbort,
    Unknown,
}

impl fmt::Display for PanicReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PanicReason::StackOverflow => "stack_overflow",
            PanicReason::MemoryCorruption => "memory_corruption",
            PanicReason::WatchdogTimeout => "timeout",
            PanicReason::AssertionFailed => "assertion_failed",
            PanicReason::UserAbort => "user_abort",
            PanicReason::Unknown => "unknown",
        };
        f.pad(s)
    }
}

/// Memory pool a registry record is allocated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryKind {
    /// General-purpose internal RAM.
    Internal,
    /// External, slower RAM.
    Spiram,
    /// Fast, DMA-capable RAM.
    Dma,
}

impl MemoryKind {
    pub const ALL: [MemoryKind; 3] = [MemoryKind::Internal, MemoryKind::Spiram, MemoryKind::Dma];

    /// Position of this pool in [`MemoryKind::ALL`].
    pub fn slot(self) -> usize {
        self as usize
    }
}

impl fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MemoryKind::Internal => "internal",
            MemoryKind::Spiram => "spiram",
            MemoryKind::Dma => "dma",
        };
        f.pad(s)
    }
}

/// Classification of a queued message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Data,
    Command,
    Event,
    Response,
    /// Stamped by the queue registry on broadcast copies.
    Broadcast,
    System,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MessageKind::Data => "data",
            MessageKind::Command => "command",
            MessageKind::Event => "event",
            MessageKind::Response => "response",
            MessageKind::Broadcast => "broadcast",
            MessageKind::System => "system",
        };
        f.pad(s)
    }
}

/// Urgency tag of a queued message.  Queues stay FIFO; the tag is carried
/// for the receiver.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum MessagePriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// Classification of a published event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    #[default]
    System,
    Hardware,
    User,
    Timer,
    Error,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventKind::System => "system",
            EventKind::Hardware => "hardware",
            EventKind::User => "user",
            EventKind::Timer => "timer",
            EventKind::Error => "error",
        };
        f.pad(s)
    }
}

/// Kind of a resource tracked by the resource registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    File,
    Socket,
    MemoryRegion,
    HardwarePeripheral,
    Mutex,
    Semaphore,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceKind::File => "file",
            ResourceKind::Socket => "socket",
            ResourceKind::MemoryRegion => "memory_region",
            ResourceKind::HardwarePeripheral => "peripheral",
            ResourceKind::Mutex => "mutex",
            ResourceKind::Semaphore => "semaphore",
        };
        f.pad(s)
    }
}

/// Error type shared by every kernel registry.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KernelError {
    #[error("Invalid parameter: {0}")]
    InvalidParam(String),

    #[error("Out of memory: {0}")]
    Memory(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Substrate failure: {0}")]
    Substrate(String),

    /// A name is already taken or a resource is held exclusively elsewhere.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Timed out: {0}")]
    Timeout(String),
}

impl KernelError {
    /// Numeric result code for C-style callers (`ERROR`, `MEMORY`,
    /// `INVALID_PARAM`, `TIMEOUT`, `NOT_FOUND`).
    pub fn code(&self) -> i32 {
        match self {
            KernelError::Substrate(_) | KernelError::Conflict(_) => -1,
            KernelError::Memory(_) => -2,
            KernelError::InvalidParam(_) => -3,
            KernelError::Timeout(_) => -4,
            KernelError::NotFound(_) => -5,
        }
    }
}

pub type KernelResult<T> = Result<T, KernelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_levels_preserve_order() {
        let all = [
            Priority::Idle,
            Priority::Low,
            Priority::Normal,
            Priority::High,
            Priority::Critical,
        ];
        for pair in all.windows(2) {
            assert!(pair[0] < pair[1]);
            assert!(pair[0].substrate_level() < pair[1].substrate_level());
        }
        assert_eq!(Priority::Idle.substrate_level(), 1);
        assert_eq!(Priority::Critical.substrate_level(), 5);
    }

    #[test]
    fn priority_parses_case_insensitively() {
        assert_eq!("HIGH".parse::<Priority>().unwrap(), Priority::High);
        assert_eq!(" normal ".parse::<Priority>().unwrap(), Priority::Normal);
        assert!(matches!(
            "urgent".parse::<Priority>(),
            Err(KernelError::InvalidParam(_))
        ));
    }

    #[test]
    fn watchdog_timeout_displays_as_timeout() {
        assert_eq!(PanicReason::WatchdogTimeout.to_string(), "timeout");
    }

    #[test]
    fn bounded_name_truncates_on_char_boundary() {
        assert_eq!(bounded_name("Worker"), "Worker");
        let long = "x".repeat(40);
        assert_eq!(bounded_name(&long).len(), MAX_NAME_LEN);
        // 'é' is two bytes; 30 ASCII bytes + 'é' would straddle the limit.
        let tricky = format!("{}é", "a".repeat(30));
        let cut = bounded_name(&tricky);
        assert_eq!(cut, "a".repeat(30));
    }

    #[test]
    fn ids_parse_and_display() {
        let pid: Pid = "42".parse().unwrap();
        assert_eq!(pid, Pid(42));
        assert_eq!(pid.to_string(), "42");
        assert!("abc".parse::<TimerId>().is_err());
    }

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(KernelError::Substrate("x".into()).code(), -1);
        assert_eq!(KernelError::Memory("x".into()).code(), -2);
        assert_eq!(KernelError::InvalidParam("x".into()).code(), -3);
        assert_eq!(KernelError::NotFound("x".into()).code(), -5);
        assert_eq!(KernelError::Conflict("x".into()).code(), -1);
        assert_eq!(KernelError::Timeout("x".into()).code(), -4);
    }

    #[test]
    fn resource_kind_serializes_in_snake_case() {
        let json = serde_json::to_string(&ResourceKind::MemoryRegion).unwrap();
        assert_eq!(json, "\"memory_region\"");
        assert_eq!(MessagePriority::default(), MessagePriority::Normal);
        assert!(MessagePriority::Critical > MessagePriority::Low);
    }

    #[test]
    fn kernel_error_display() {
        let err = KernelError::NotFound("process 7".to_string());
        assert!(err.to_string().contains("process 7"));
    }

    #[test]
    fn process_state_serialization_roundtrip() {
        let json = serde_json::to_string(&ProcessState::Blocked).unwrap();
        assert_eq!(json, "\"blocked\"");
        let back: ProcessState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ProcessState::Blocked);
    }
}
