//! ipa-fabric - packet accelerator data path
//!
//! Moves packets between the terminals of a shared DMA fabric over
//! hardware descriptor rings: endpoints own a send and a receive fifo,
//! a worker per receiving endpoint harvests completions, recycles buffers
//! in completion order and dispatches payloads to virtual NICs.
//!
//! Register access is injected through [`hal::FifoOps`];
//! [`hal::soft::SoftwareFabric`] implements it in memory.

pub mod endpoint;
pub mod fifo;
pub mod hal;
pub mod memory;
pub mod nic;
pub mod poll;
pub mod queue;
pub mod receiver;
pub mod sender;
pub mod topology;
pub mod utils;

// Re-export key components
pub use endpoint::{
    ConnectParams, ConnectionInfo, Endpoint, EndpointRegistry, EndpointState, FifoRole,
    NotifyCallback, PostedBuffer,
};
pub use fifo::{CommonFifo, Descriptor, FifoParams, FifoSizing, RingSizing};
pub use hal::soft::{SoftPacket, SoftwareFabric};
pub use hal::{FifoEvents, FifoOps, FillDepth};
pub use memory::{AllocationStats, DmaBuffer, Placement, RingAllocator};
pub use nic::{FlowFilter, NicConfig, RecvHandler, RecvPacket, VirtualNic};
pub use receiver::{CycleReport, Receiver, ReceiverConfig, ReceiverStatsView};
pub use sender::{Sender, SenderStatsView};
pub use topology::{EndpointId, FifoId, TermMask, Terminal};

use log::{error, info, warn};
use parking_lot::Mutex;
use poll::{IrqDispatch, IrqStatsView, Worker};
use receiver::SkbReceiver;
use sender::SkbSender;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use utils::cpu::{WorkerOptions, RECV_RT_PRIORITY};

/// ipa-fabric error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("Ring full on fifo {0}")]
    RingFull(FifoId),

    #[error("Ring empty on fifo {0}")]
    RingEmpty(FifoId),

    #[error("Buffer pool full")]
    PoolFull,

    #[error("Buffer pool empty")]
    PoolEmpty,

    #[error("Fifo {0} is in flow control")]
    FlowControlled(FifoId),

    #[error("Descriptor on fifo {fifo} loops terminal {terminal} back to itself")]
    SelfLoop { fifo: FifoId, terminal: u8 },

    #[error("Fast memory exhausted: {requested} bytes requested, {available} available")]
    FastMemoryExhausted { requested: usize, available: usize },

    #[error("Invalid ring depth {0}: must be a non-zero power of two")]
    InvalidDepth(usize),

    #[error("Fifo {0} is not open")]
    FifoNotOpen(FifoId),

    #[error("Endpoint {0} is not configured")]
    UnknownEndpoint(EndpointId),

    #[error("Endpoint {0} failed bring-up")]
    EndpointUnavailable(EndpointId),

    #[error("Endpoint {endpoint} has no {role} fifo")]
    MissingFifo { endpoint: EndpointId, role: FifoRole },

    #[error("Endpoint {0} has no receiver")]
    NoReceiver(EndpointId),

    #[error("Endpoint {0} has a running receiver owning its free buffers")]
    ReceiverActive(EndpointId),

    #[error("NIC table full ({0} entries)")]
    NicTableFull(usize),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Completion order mismatch on {endpoint}: expected {expected:#x}, got {actual:#x}")]
    OrderMismatch {
        endpoint: EndpointId,
        expected: u64,
        actual: u64,
    },

    #[error("Completion {address:#x} on {endpoint} with no buffer outstanding")]
    UnexpectedCompletion { endpoint: EndpointId, address: u64 },

    #[error("No NIC accepts source {source_id} flow {flow_id}")]
    NoMatchingNic { source_id: u8, flow_id: u8 },

    #[error("Memory allocation failed: {0}")]
    MemoryAllocation(String),

    #[error("Hardware error: {0}")]
    Hardware(String),

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] serde_json::Error),
}

/// Failure classes and how far each one propagates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Expected control-flow signal, handled where it occurs
    Capacity,
    /// Aborts the affected endpoint's bring-up
    Configuration,
    /// Abandons the current harvest cycle only
    Consistency,
    /// Packet counted and dropped
    Dispatch,
    System,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::RingFull(_)
            | Error::RingEmpty(_)
            | Error::PoolFull
            | Error::PoolEmpty
            | Error::FlowControlled(_) => ErrorKind::Capacity,
            Error::SelfLoop { .. }
            | Error::FastMemoryExhausted { .. }
            | Error::InvalidDepth(_)
            | Error::FifoNotOpen(_)
            | Error::UnknownEndpoint(_)
            | Error::EndpointUnavailable(_)
            | Error::MissingFifo { .. }
            | Error::NoReceiver(_)
            | Error::ReceiverActive(_)
            | Error::NicTableFull(_)
            | Error::InvalidConfig(_) => ErrorKind::Configuration,
            Error::OrderMismatch { .. } | Error::UnexpectedCompletion { .. } => {
                ErrorKind::Consistency
            }
            Error::NoMatchingNic { .. } => ErrorKind::Dispatch,
            Error::MemoryAllocation(_)
            | Error::Hardware(_)
            | Error::Worker(_)
            | Error::IoError(_)
            | Error::ConfigParse(_) => ErrorKind::System,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Fabric configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Size of the on-chip fast memory region, zero for none
    pub fast_memory_size: usize,

    /// Device address of the fast memory region
    pub fast_memory_base: u64,

    /// Start of the fabric register file
    pub register_base: u64,

    /// Place rings in general memory once fast memory is exhausted
    pub fast_memory_fallback: bool,

    /// Usable receive buffer length
    pub recv_buf_len: usize,

    /// Headroom reserved on top of each receive buffer
    pub recv_rsvd_len: usize,

    /// Where payloads start inside a buffer
    pub payload_offset: usize,

    /// Default completion interrupt threshold
    pub intr_threshold: u32,

    /// Default completion interrupt delay
    pub intr_delay_us: u32,

    /// NICs per receiver
    pub max_nics: usize,

    /// How often parked workers re-check their ring
    pub wait_poll_interval_ms: u64,

    /// Real-time priority for send workers
    pub rt_priority: Option<i32>,

    /// SCHED_RR priority for receive workers, `None` for default scheduling
    pub recv_rt_priority: Option<i32>,

    /// CPU affinity settings
    pub cpu_affinity: Option<Vec<usize>>,

    /// Ring sizing per fifo; fifos with no tx depth stay down
    pub fifos: Vec<FifoSizing>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            fast_memory_size: 0,
            fast_memory_base: 0,
            register_base: 0x2100_0000,
            fast_memory_fallback: true,
            recv_buf_len: 1600,
            recv_rsvd_len: 64,
            payload_offset: 64,
            intr_threshold: 32,
            intr_delay_us: 0,
            max_nics: 8,
            wait_poll_interval_ms: 10,
            rt_priority: None,
            recv_rt_priority: Some(RECV_RT_PRIORITY),
            cpu_affinity: None,
            fifos: FifoId::ALL
                .iter()
                .map(|&fifo| FifoSizing {
                    fifo,
                    tx: RingSizing::general(64),
                    rx: RingSizing::general(64),
                })
                .collect(),
        }
    }
}

impl Config {
    /// Load a JSON configuration file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        utils::config::load(path)
    }

    /// Full size of one receive buffer
    pub fn buffer_size(&self) -> usize {
        self.recv_buf_len + self.recv_rsvd_len
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.wait_poll_interval_ms)
    }

    pub fn worker_options(&self) -> WorkerOptions {
        WorkerOptions {
            rt_priority: self.rt_priority,
            affinity: self.cpu_affinity.clone(),
        }
    }

    /// Worker options with the receive real-time priority
    pub fn receiver_worker_options(&self) -> WorkerOptions {
        WorkerOptions {
            rt_priority: self.recv_rt_priority,
            ..self.worker_options()
        }
    }

    fn receiver_config(&self) -> ReceiverConfig {
        ReceiverConfig {
            buf_len: self.recv_buf_len,
            rsvd_len: self.recv_rsvd_len,
            offset: self.payload_offset as u16,
            max_nics: self.max_nics,
        }
    }
}

/// Main fabric context
///
/// Owns every endpoint, the ring allocator, interrupt fan-out and the
/// pipeline workers. Endpoints that fail bring-up are recorded and refuse
/// further use; the rest of the fabric keeps running.
pub struct Fabric {
    config: Config,
    hal: Arc<dyn FifoOps>,
    allocator: RingAllocator,
    registry: Arc<EndpointRegistry>,
    irq: Arc<IrqDispatch>,
    notifier: Mutex<Option<Worker>>,
    receivers: Mutex<HashMap<EndpointId, SkbReceiver>>,
    senders: Mutex<HashMap<EndpointId, SkbSender>>,
    bringup_failures: Vec<(EndpointId, Error)>,
}

impl Fabric {
    /// Create a fabric over `hal` and bring up every configured endpoint
    pub fn new(config: Config, hal: Arc<dyn FifoOps>) -> Result<Self> {
        utils::config::validate(&config)?;

        let allocator = RingAllocator::new(config.fast_memory_size, config.fast_memory_base)?;
        let registry = Arc::new(EndpointRegistry::build(
            &config.fifos,
            config.register_base,
            &hal,
        ));
        let irq = Arc::new(IrqDispatch::new(registry.fifos()));
        hal.register_irq_handler(irq.handler());

        let mut bringup_failures = Vec::new();
        for endpoint in registry.iter() {
            if let Err(e) = endpoint.bring_up(&allocator, config.fast_memory_fallback) {
                error!("endpoint {} bring-up failed: {}", endpoint.id(), e);
                bringup_failures.push((endpoint.id(), e));
            }
        }

        let notifier = {
            let ready_irq = Arc::clone(&irq);
            let drain_irq = Arc::clone(&irq);
            let registry = Arc::clone(&registry);
            Worker::spawn(
                "ipa-notify",
                irq.notifier(),
                WorkerOptions::default(),
                config.poll_interval(),
                move || ready_irq.has_pending(),
                move || {
                    drain_irq.drain_pending(|fifo, events| {
                        if let Some(endpoint) = registry.by_fifo(fifo) {
                            endpoint.notify(fifo, events);
                        }
                    });
                },
            )?
        };

        info!(
            "fabric up: {} endpoints, {} failed bring-up",
            registry.len(),
            bringup_failures.len()
        );
        Ok(Self {
            config,
            hal,
            allocator,
            registry,
            irq,
            notifier: Mutex::new(Some(notifier)),
            receivers: Mutex::new(HashMap::new()),
            senders: Mutex::new(HashMap::new()),
            bringup_failures,
        })
    }

    /// Create a fabric over a fresh software-emulated fabric
    pub fn software(config: Config) -> Result<(Self, Arc<SoftwareFabric>)> {
        let soft = Arc::new(SoftwareFabric::new());
        let hal: Arc<dyn FifoOps> = soft.clone();
        Ok((Self::new(config, hal)?, soft))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn hal(&self) -> &Arc<dyn FifoOps> {
        &self.hal
    }

    pub fn endpoint(&self, id: EndpointId) -> Result<&Arc<Endpoint>> {
        self.registry.get(id)
    }

    pub fn endpoints(&self) -> &EndpointRegistry {
        &self.registry
    }

    /// Bind callbacks and fifo parameters
    ///
    /// A receive fifo connected without parameters gets the pipeline
    /// defaults. Free buffers are refused with [`Error::ReceiverActive`]
    /// while a receiver owns the endpoint's receive fifo.
    pub fn connect(&self, id: EndpointId, mut params: ConnectParams) -> Result<ConnectionInfo> {
        let endpoint = self.registry.get(id)?;
        if params.recv_param.is_none() {
            params.recv_param = endpoint.recv_fifo().map(|fifo| self.receive_defaults(fifo));
        }
        let receivers = self.receivers.lock();
        if !params.recv_buffers.is_empty() && receivers.contains_key(&id) {
            return Err(Error::ReceiverActive(id));
        }
        endpoint.connect(&self.allocator, self.config.fast_memory_fallback, params)
    }

    fn receive_defaults(&self, fifo: &CommonFifo) -> FifoParams {
        FifoParams::receiver_default(
            fifo.sizing().rx.depth,
            self.config.intr_threshold,
            self.config.intr_delay_us,
        )
    }

    pub fn disconnect(&self, id: EndpointId) -> Result<()> {
        self.registry.get(id)?.disconnect()
    }

    pub fn enable_receive(&self, id: EndpointId, enabled: bool) -> Result<()> {
        self.registry.get(id)?.set_receiving(enabled)
    }

    /// Post caller-owned free buffers into an endpoint's receive fifo
    ///
    /// Refused with [`Error::ReceiverActive`] once a receiver runs on the
    /// endpoint: its pool must match every completion in order.
    pub fn init_free_fifo(&self, id: EndpointId, buffers: &[PostedBuffer]) -> Result<()> {
        let endpoint = self.registry.get(id)?;
        let receivers = self.receivers.lock();
        if receivers.contains_key(&id) {
            return Err(Error::ReceiverActive(id));
        }
        endpoint.init_free_fifo(buffers)
    }

    /// Start the receive pipeline of an endpoint
    ///
    /// A receive fifo nobody configured gets the pipeline defaults before
    /// the buffer pool is prefilled and the worker spawned. Returns the
    /// running pipeline if one already exists.
    pub fn create_receiver(&self, id: EndpointId) -> Result<Arc<Receiver>> {
        let mut receivers = self.receivers.lock();
        if let Some(existing) = receivers.get(&id) {
            return Ok(Arc::clone(existing.receiver()));
        }

        let endpoint = self.registry.get(id)?;
        if endpoint.state() == EndpointState::Unavailable {
            return Err(Error::EndpointUnavailable(id));
        }
        let fifo = endpoint.fifo(FifoRole::Recv)?;
        if fifo.params().is_none() {
            fifo.configure(&self.receive_defaults(fifo), false)?;
        }
        let receiver = Arc::new(Receiver::new(
            id,
            Arc::clone(fifo),
            self.config.receiver_config(),
        )?);
        receiver.prefill()?;

        let worker = SkbReceiver::spawn(
            Arc::clone(&receiver),
            Arc::clone(&self.irq),
            self.config.receiver_worker_options(),
            self.config.poll_interval(),
        )?;
        receivers.insert(id, worker);
        info!("receiver {} running on fifo {}", id, fifo.id());
        Ok(receiver)
    }

    pub fn receiver(&self, id: EndpointId) -> Option<Arc<Receiver>> {
        self.receivers
            .lock()
            .get(&id)
            .map(|worker| Arc::clone(worker.receiver()))
    }

    pub fn receiver_stats(&self, id: EndpointId) -> Option<ReceiverStatsView> {
        self.receiver(id).map(|receiver| receiver.stats())
    }

    /// Start the transmit path of an endpoint
    ///
    /// NICs already registered on the endpoint get the sender bound.
    pub fn create_sender(&self, id: EndpointId) -> Result<Arc<Sender>> {
        let sender = {
            let mut senders = self.senders.lock();
            if let Some(existing) = senders.get(&id) {
                return Ok(Arc::clone(existing.sender()));
            }

            let endpoint = self.registry.get(id)?;
            if endpoint.state() == EndpointState::Unavailable {
                return Err(Error::EndpointUnavailable(id));
            }
            let fifo = endpoint.fifo(FifoRole::Send)?;
            let sender = Arc::new(Sender::new(
                id,
                Arc::clone(fifo),
                self.config.payload_offset as u16,
            )?);
            let worker = SkbSender::spawn(
                Arc::clone(&sender),
                Arc::clone(&self.irq),
                self.config.worker_options(),
                self.config.poll_interval(),
            )?;
            senders.insert(id, worker);
            sender
        };

        if let Some(receiver) = self.receiver(id) {
            for nic in receiver.nics().nics() {
                nic.bind_sender(Arc::clone(&sender));
            }
        }
        Ok(sender)
    }

    pub fn sender(&self, id: EndpointId) -> Option<Arc<Sender>> {
        self.senders
            .lock()
            .get(&id)
            .map(|worker| Arc::clone(worker.sender()))
    }

    /// Register a NIC on an endpoint's receive pipeline
    pub fn add_nic(
        &self,
        id: EndpointId,
        config: NicConfig,
        handler: RecvHandler,
    ) -> Result<Arc<VirtualNic>> {
        let receiver = self.receiver(id).ok_or(Error::NoReceiver(id))?;
        let nic = Arc::new(VirtualNic::new(config, handler));
        if let Some(sender) = self.sender(id) {
            nic.bind_sender(sender);
        }
        receiver.add_nic(Arc::clone(&nic))?;
        Ok(nic)
    }

    /// Ring occupancy of one fifo
    pub fn fill_depth(&self, fifo: FifoId) -> Result<FillDepth> {
        self.registry
            .fifo(fifo)
            .ok_or(Error::FifoNotOpen(fifo))?
            .fill_depth()
    }

    /// Endpoints that failed bring-up, with the reason
    pub fn bringup_failures(&self) -> &[(EndpointId, Error)] {
        &self.bringup_failures
    }

    pub fn allocation_stats(&self) -> AllocationStats {
        self.allocator.stats()
    }

    pub fn irq_stats(&self) -> IrqStatsView {
        self.irq.stats()
    }

    /// Disconnect an endpoint and stop its workers after their current cycle
    pub fn teardown(&self, id: EndpointId) -> Result<()> {
        let endpoint = self.registry.get(id)?;
        if endpoint.state() != EndpointState::Unavailable {
            endpoint.disconnect()?;
        }

        let receiver = self.receivers.lock().remove(&id);
        if let Some(mut receiver) = receiver {
            receiver.stop()?;
        }
        let sender = self.senders.lock().remove(&id);
        if let Some(mut sender) = sender {
            sender.stop()?;
        }
        info!("endpoint {} torn down", id);
        Ok(())
    }

    /// Stop every worker; rings stay allocated until the fabric drops
    pub fn shutdown(&self) -> Result<()> {
        let receivers: Vec<SkbReceiver> = self.receivers.lock().drain().map(|(_, w)| w).collect();
        let senders: Vec<SkbSender> = self.senders.lock().drain().map(|(_, w)| w).collect();

        let mut outcome = Ok(());
        for mut receiver in receivers {
            if let Err(e) = receiver.stop() {
                warn!("stopping receiver {}: {}", receiver.receiver().endpoint(), e);
                outcome = Err(e);
            }
        }
        for mut sender in senders {
            if let Err(e) = sender.stop() {
                warn!("stopping sender {}: {}", sender.sender().endpoint(), e);
                outcome = Err(e);
            }
        }
        let notifier = self.notifier.lock().take();
        if let Some(mut notifier) = notifier {
            notifier.stop()?;
            info!("fabric shut down");
        }
        outcome
    }
}

impl Drop for Fabric {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!("fabric shutdown: {}", e);
        }
    }
}
