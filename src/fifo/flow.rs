//! Flow-control watermarks and per-fifo flow state

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Which ring's occupancy drives flow control
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowCtrlSource {
    /// Free buffers in the rx ring running low
    RxEmpty,
    /// Completions piling up in the tx ring
    TxFull,
    Both,
}

impl FlowCtrlSource {
    fn watches_rx(self) -> bool {
        matches!(self, FlowCtrlSource::RxEmpty | FlowCtrlSource::Both)
    }

    fn watches_tx(self) -> bool {
        matches!(self, FlowCtrlSource::TxFull | FlowCtrlSource::Both)
    }
}

/// Which flow-control crossings raise an interrupt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowCtrlIrqMode {
    EnterExit,
    Enter,
    Exit,
}

impl FlowCtrlIrqMode {
    pub fn reports(self, transition: FlowTransition) -> bool {
        match (self, transition) {
            (FlowCtrlIrqMode::EnterExit, _) => true,
            (FlowCtrlIrqMode::Enter, FlowTransition::Enter) => true,
            (FlowCtrlIrqMode::Exit, FlowTransition::Leave) => true,
            _ => false,
        }
    }
}

/// Enter/leave thresholds for both rings of a fifo
///
/// Two thresholds per ring give hysteresis: between them the current
/// state is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Watermarks {
    pub rx_enter: u32,
    pub rx_leave: u32,
    pub tx_enter: u32,
    pub tx_leave: u32,
}

impl Watermarks {
    /// rx watermarks take part only when leave sits above enter
    pub fn rx_enabled(&self) -> bool {
        self.rx_leave > self.rx_enter
    }

    /// tx watermarks take part only when enter sits above leave
    pub fn tx_enabled(&self) -> bool {
        self.tx_enter > 0 && self.tx_enter > self.tx_leave
    }

    pub fn validate(&self, depth: usize) -> Result<()> {
        let depth = depth as u32;
        for (name, value) in [
            ("rx_enter", self.rx_enter),
            ("rx_leave", self.rx_leave),
            ("tx_enter", self.tx_enter),
            ("tx_leave", self.tx_leave),
        ] {
            if value > depth {
                return Err(Error::InvalidConfig(format!(
                    "watermark {} = {} exceeds ring depth {}",
                    name, value, depth
                )));
            }
        }
        if self.rx_leave != 0 && self.rx_leave < self.rx_enter {
            return Err(Error::InvalidConfig(format!(
                "rx leave watermark {} below enter watermark {}",
                self.rx_leave, self.rx_enter
            )));
        }
        if self.tx_enter != 0 && self.tx_enter < self.tx_leave {
            return Err(Error::InvalidConfig(format!(
                "tx enter watermark {} below leave watermark {}",
                self.tx_enter, self.tx_leave
            )));
        }
        Ok(())
    }
}

/// Flow-control programming of one fifo
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowControlConfig {
    pub source: FlowCtrlSource,
    pub irq_mode: FlowCtrlIrqMode,
    pub watermarks: Watermarks,
    /// Remote flow control (receiving fifo) rather than local
    pub remote: bool,
}

impl FlowControlConfig {
    /// Transition implied by the current ring levels, if any
    ///
    /// `rx_level` is the number of descriptors queued for the hardware,
    /// `tx_level` the number of completions awaiting software.
    pub fn evaluate(&self, asserted: bool, rx_level: u32, tx_level: u32) -> Option<FlowTransition> {
        let marks = &self.watermarks;
        let rx = self.source.watches_rx() && marks.rx_enabled();
        let tx = self.source.watches_tx() && marks.tx_enabled();
        if !rx && !tx {
            return None;
        }

        if !asserted {
            let rx_enter = rx && rx_level <= marks.rx_enter;
            let tx_enter = tx && tx_level >= marks.tx_enter;
            (rx_enter || tx_enter).then_some(FlowTransition::Enter)
        } else {
            let rx_clear = !rx || rx_level >= marks.rx_leave;
            let tx_clear = !tx || tx_level <= marks.tx_leave;
            (rx_clear && tx_clear).then_some(FlowTransition::Leave)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowTransition {
    Enter,
    Leave,
}

/// Software view of a fifo's flow-control request
///
/// Transitions arrive asynchronously from interrupt context; applying the
/// same transition twice is a no-op.
#[derive(Debug, Default)]
pub struct FlowControl {
    asserted: AtomicBool,
    enters: AtomicUsize,
    leaves: AtomicUsize,
}

impl FlowControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a transition; returns whether the state changed
    pub fn apply(&self, transition: FlowTransition) -> bool {
        let target = transition == FlowTransition::Enter;
        let changed = self
            .asserted
            .compare_exchange(!target, target, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if changed {
            let counter = if target { &self.enters } else { &self.leaves };
            counter.fetch_add(1, Ordering::Relaxed);
        }
        changed
    }

    #[inline]
    pub fn is_asserted(&self) -> bool {
        self.asserted.load(Ordering::Acquire)
    }

    /// Number of (enter, leave) transitions actually applied
    pub fn transitions(&self) -> (usize, usize) {
        (
            self.enters.load(Ordering::Relaxed),
            self.leaves.load(Ordering::Relaxed),
        )
    }

    pub fn reset(&self) {
        self.asserted.store(false, Ordering::Release);
    }
}

/// Parameters a client opens a common fifo with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FifoParams {
    pub tx_intr_delay_us: u32,
    pub tx_intr_threshold: u32,
    pub flowctrl_in_tx_full: bool,
    pub flow_ctrl_cfg: FlowCtrlSource,
    pub flow_ctrl_irq_mode: FlowCtrlIrqMode,
    pub watermarks: Watermarks,
}

impl Default for FifoParams {
    fn default() -> Self {
        Self {
            tx_intr_delay_us: 0,
            tx_intr_threshold: 0,
            flowctrl_in_tx_full: false,
            flow_ctrl_cfg: FlowCtrlSource::RxEmpty,
            flow_ctrl_irq_mode: FlowCtrlIrqMode::EnterExit,
            watermarks: Watermarks::default(),
        }
    }
}

impl FifoParams {
    /// Parameters the receive pipeline opens its fifo with
    pub fn receiver_default(depth: usize, threshold: u32, delay_us: u32) -> Self {
        let depth = depth as u32;
        Self {
            tx_intr_delay_us: delay_us,
            tx_intr_threshold: threshold,
            flowctrl_in_tx_full: false,
            flow_ctrl_cfg: FlowCtrlSource::RxEmpty,
            flow_ctrl_irq_mode: FlowCtrlIrqMode::EnterExit,
            watermarks: Watermarks {
                rx_enter: depth / 4,
                rx_leave: depth / 2,
                tx_enter: 0,
                tx_leave: 0,
            },
        }
    }

    pub fn flow_control(&self, remote: bool) -> FlowControlConfig {
        FlowControlConfig {
            source: self.flow_ctrl_cfg,
            irq_mode: self.flow_ctrl_irq_mode,
            watermarks: self.watermarks,
            remote,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn receiver_cfg() -> FlowControlConfig {
        FifoParams::receiver_default(64, 32, 0).flow_control(true)
    }

    #[test]
    fn test_receiver_default_watermarks() {
        let params = FifoParams::receiver_default(64, 32, 0);
        assert_eq!(params.watermarks.rx_enter, 16);
        assert_eq!(params.watermarks.rx_leave, 32);
        assert!(!params.watermarks.tx_enabled());
        assert_eq!(params.tx_intr_threshold, 32);
        params.watermarks.validate(64).unwrap();
    }

    #[test]
    fn test_hysteresis() {
        let cfg = receiver_cfg();
        // Plenty of free buffers: nothing to do
        assert_eq!(cfg.evaluate(false, 40, 0), None);
        // Dropping to the enter mark asserts
        assert_eq!(cfg.evaluate(false, 16, 0), Some(FlowTransition::Enter));
        // Between the marks the asserted state holds
        assert_eq!(cfg.evaluate(true, 20, 0), None);
        assert_eq!(cfg.evaluate(true, 31, 0), None);
        assert_eq!(cfg.evaluate(true, 32, 0), Some(FlowTransition::Leave));
        // ...and so does the released state
        assert_eq!(cfg.evaluate(false, 20, 0), None);
    }

    #[test]
    fn test_tx_watermarks() {
        let cfg = FlowControlConfig {
            source: FlowCtrlSource::TxFull,
            irq_mode: FlowCtrlIrqMode::EnterExit,
            watermarks: Watermarks {
                rx_enter: 0,
                rx_leave: 0,
                tx_enter: 48,
                tx_leave: 16,
            },
            remote: false,
        };
        assert_eq!(cfg.evaluate(false, 0, 47), None);
        assert_eq!(cfg.evaluate(false, 0, 48), Some(FlowTransition::Enter));
        assert_eq!(cfg.evaluate(true, 0, 17), None);
        assert_eq!(cfg.evaluate(true, 0, 16), Some(FlowTransition::Leave));
    }

    #[test]
    fn test_apply_is_idempotent() {
        let flow = FlowControl::new();
        assert!(flow.apply(FlowTransition::Enter));
        assert!(!flow.apply(FlowTransition::Enter));
        assert!(flow.is_asserted());
        assert_eq!(flow.transitions(), (1, 0));

        assert!(flow.apply(FlowTransition::Leave));
        assert!(!flow.apply(FlowTransition::Leave));
        assert!(!flow.is_asserted());
        assert_eq!(flow.transitions(), (1, 1));
    }

    #[test]
    fn test_irq_mode_filter() {
        assert!(FlowCtrlIrqMode::Enter.reports(FlowTransition::Enter));
        assert!(!FlowCtrlIrqMode::Enter.reports(FlowTransition::Leave));
        assert!(FlowCtrlIrqMode::Exit.reports(FlowTransition::Leave));
        assert!(FlowCtrlIrqMode::EnterExit.reports(FlowTransition::Leave));
    }

    #[test]
    fn test_watermark_validation() {
        let marks = Watermarks {
            rx_enter: 40,
            rx_leave: 20,
            tx_enter: 0,
            tx_leave: 0,
        };
        assert!(marks.validate(64).is_err());
        let marks = Watermarks {
            rx_enter: 10,
            rx_leave: 100,
            tx_enter: 0,
            tx_leave: 0,
        };
        assert!(marks.validate(64).is_err());
    }
}
