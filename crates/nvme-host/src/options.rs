use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::command::Completion;

/// Command arbitration mechanism programmed into CC.AMS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Arbitration {
    #[default]
    RoundRobin,
    WeightedRoundRobin,
    VendorSpecific,
}

impl Arbitration {
    pub(crate) fn cc_ams(self) -> u8 {
        match self {
            Arbitration::RoundRobin => 0,
            Arbitration::WeightedRoundRobin => 1,
            Arbitration::VendorSpecific => 7,
        }
    }

    /// CAP.AMS bit advertising this mechanism, if it needs one.
    pub(crate) fn cap_bit(self) -> Option<u8> {
        match self {
            Arbitration::RoundRobin => None,
            Arbitration::WeightedRoundRobin => Some(1 << 0),
            Arbitration::VendorSpecific => Some(1 << 1),
        }
    }
}

/// Submission queue priority for weighted round robin arbitration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueuePriority {
    /// The only priority honored under round robin arbitration.
    #[default]
    Urgent = 0,
    High = 1,
    Medium = 2,
    Low = 3,
}

/// Called with every asynchronous event completion.
pub type AerHandler = Arc<dyn Fn(&Completion) + Send + Sync>;

/// Controller configuration passed to attach.
#[derive(Clone)]
pub struct ControllerOptions {
    /// I/O queue pairs to request from the controller.
    pub num_io_queues: u32,
    /// Entries per I/O queue, clamped to CAP.MQES + 1.
    pub io_queue_size: u32,
    /// Pooled requests per I/O queue pair.
    pub io_queue_requests: u32,
    pub admin_queue_size: u32,
    pub admin_requests: u32,
    pub arbitration: Arbitration,
    /// Place I/O submission queues in the controller memory buffer.
    pub use_cmb_sqs: bool,
    /// Resubmissions allowed for a retryable completion.
    pub max_retries: u32,
    /// Upper bound for a synchronous admin command; `None` waits forever.
    pub admin_timeout: Option<Duration>,
    /// Sleep between bring-up state machine steps.
    pub init_poll_interval: Duration,
    pub aer_handler: Option<AerHandler>,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            num_io_queues: 1,
            io_queue_size: 256,
            io_queue_requests: 512,
            admin_queue_size: 32,
            admin_requests: 64,
            arbitration: Arbitration::RoundRobin,
            use_cmb_sqs: false,
            max_retries: 3,
            admin_timeout: Some(Duration::from_secs(30)),
            init_poll_interval: Duration::from_millis(1),
            aer_handler: None,
        }
    }
}

impl fmt::Debug for ControllerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControllerOptions")
            .field("num_io_queues", &self.num_io_queues)
            .field("io_queue_size", &self.io_queue_size)
            .field("io_queue_requests", &self.io_queue_requests)
            .field("admin_queue_size", &self.admin_queue_size)
            .field("admin_requests", &self.admin_requests)
            .field("arbitration", &self.arbitration)
            .field("use_cmb_sqs", &self.use_cmb_sqs)
            .field("max_retries", &self.max_retries)
            .field("admin_timeout", &self.admin_timeout)
            .field("init_poll_interval", &self.init_poll_interval)
            .field("aer_handler", &self.aer_handler.is_some())
            .finish()
    }
}

/// Options for acquiring an I/O queue pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QpairOptions {
    pub priority: QueuePriority,
    /// Queue depth; defaults to the controller's I/O queue size.
    pub queue_size: Option<u32>,
}
