//! Radio state supervisor
//!
//! Owns the transceiver mode and is the only place it changes. Components
//! ask for transitions; the supervisor refuses the ones the transceiver
//! cannot make and drives the [`Phy`] for the ones it can.
//!
//! Legal transitions:
//! - SLEEP/STANDBY -> STANDBY (open a receive window)
//! - SLEEP/STANDBY/RX -> SLEEP (window closed, or reception handled)
//! - SLEEP/STANDBY -> TX (uplink)
//! - STANDBY -> RX (physical layer detected a preamble)
//! - TX -> STANDBY (transmission finished)

use core::time::Duration;

use thiserror::Error;

use super::traits::{Phy, RadioState, TxParams};
use crate::lorawan::mac::Frame;

/// Refused radio transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RadioError {
    /// The transceiver is transmitting or receiving
    #[error("radio busy in {0}")]
    Busy(RadioState),
}

type Observer = Box<dyn FnMut(RadioState, RadioState)>;

/// Radio state supervisor wrapping the physical layer
pub struct RadioSupervisor<P: Phy> {
    phy: P,
    state: RadioState,
    observer: Option<Observer>,
}

impl<P: Phy> RadioSupervisor<P> {
    /// Wrap a physical layer; the radio starts asleep
    pub fn new(phy: P) -> Self {
        Self {
            phy,
            state: RadioState::Sleep,
            observer: None,
        }
    }

    /// Current transceiver mode
    pub fn state(&self) -> RadioState {
        self.state
    }

    /// Whether the radio is transmitting or receiving
    pub fn is_busy(&self) -> bool {
        matches!(self.state, RadioState::Tx | RadioState::Rx)
    }

    /// Physical layer
    pub fn phy(&self) -> &P {
        &self.phy
    }

    /// Mutable physical layer
    pub fn phy_mut(&mut self) -> &mut P {
        &mut self.phy
    }

    /// Register a consumer of every state change `(old, new)`
    pub fn set_observer<F>(&mut self, observer: F)
    where
        F: FnMut(RadioState, RadioState) + 'static,
    {
        self.observer = Some(Box::new(observer));
    }

    /// Wake the radio up to listen for a preamble
    pub fn request_standby(&mut self) -> Result<(), RadioError> {
        match self.state {
            RadioState::Sleep | RadioState::Standby => {
                self.phy.switch_to_standby();
                self.transition(RadioState::Standby);
                Ok(())
            }
            busy => Err(RadioError::Busy(busy)),
        }
    }

    /// Put the radio to sleep
    pub fn request_sleep(&mut self) -> Result<(), RadioError> {
        match self.state {
            RadioState::Tx => Err(RadioError::Busy(RadioState::Tx)),
            _ => {
                self.phy.switch_to_sleep();
                self.transition(RadioState::Sleep);
                Ok(())
            }
        }
    }

    /// Hand a frame to the physical layer. Returns its time on air.
    pub fn request_transmit(
        &mut self,
        frame: &Frame,
        params: &TxParams,
        frequency: u32,
        power: i8,
    ) -> Result<Duration, RadioError> {
        match self.state {
            RadioState::Sleep | RadioState::Standby => {
                let airtime = self.phy.on_air_time(frame, params);
                self.phy.send(frame, params, frequency, power);
                self.transition(RadioState::Tx);
                Ok(airtime)
            }
            busy => Err(RadioError::Busy(busy)),
        }
    }

    /// Tune the receiver for the next window
    pub fn tune(&mut self, frequency: u32, spreading_factor: u8) {
        self.phy.set_frequency(frequency);
        self.phy.set_spreading_factor(spreading_factor);
    }

    /// Physical layer locked on a preamble. Only a listening radio can
    /// start receiving; returns whether the radio entered RX.
    pub fn on_preamble_detected(&mut self) -> bool {
        if self.state == RadioState::Standby {
            self.transition(RadioState::Rx);
            true
        } else {
            debug!("preamble ignored, radio in {}", self.state);
            false
        }
    }

    /// Physical layer finished transmitting
    pub fn on_transmit_finished(&mut self) {
        if self.state == RadioState::Tx {
            self.transition(RadioState::Standby);
        } else {
            warn!("transmit finished while radio in {}", self.state);
        }
    }

    fn transition(&mut self, next: RadioState) {
        let previous = self.state;
        if previous == next {
            return;
        }
        trace!("radio {} -> {}", previous, next);
        self.state = next;
        if let Some(observer) = self.observer.as_mut() {
            observer(previous, next);
        }
    }
}
