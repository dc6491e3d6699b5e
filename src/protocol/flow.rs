//! SENDME flow control windows.
//!
//! Every circuit hop and every stream carries a package window (cells we
//! may still send) and a delivery window (cells the peer may still send
//! us). DATA cells decrement; SENDMEs refill. The receiver emits a SENDME
//! for every credit-worth of delivered cells, keeping the peer's package
//! window topped up.

use crate::error::{Result, TorError};

/// Initial circuit-level window (tor-spec §7.3).
pub const CIRCUIT_WINDOW_INITIAL: u16 = 1000;
/// Circuit SENDME credit.
pub const CIRCUIT_SENDME_CREDIT: u16 = 100;
/// Initial stream-level window.
pub const STREAM_WINDOW_INITIAL: u16 = 500;
/// Stream SENDME credit.
pub const STREAM_SENDME_CREDIT: u16 = 50;

/// One direction pair of windows with a fixed credit size.
#[derive(Debug, Clone)]
pub struct WindowPair {
    /// Cells we may still package and send.
    pub package: u16,
    /// Cells the peer may still deliver to us.
    pub deliver: u16,
    initial: u16,
    credit: u16,
}

impl WindowPair {
    fn new(initial: u16, credit: u16) -> Self {
        Self {
            package: initial,
            deliver: initial,
            initial,
            credit,
        }
    }

    pub fn can_package(&self) -> bool {
        self.package > 0
    }

    /// Account for one sent DATA cell.
    pub fn note_packaged(&mut self) -> Result<()> {
        if self.package == 0 {
            return Err(TorError::WindowUnderflow);
        }
        self.package -= 1;
        Ok(())
    }

    /// Account for one received SENDME.
    pub fn note_sendme_received(&mut self) {
        self.package = self.package.saturating_add(self.credit);
    }

    /// Account for one delivered DATA cell; `true` means a SENDME is owed
    /// to the peer (and the delivery window has been refilled by one
    /// credit).
    pub fn note_delivered(&mut self) -> Result<bool> {
        if self.deliver == 0 {
            return Err(TorError::WindowUnderflow);
        }
        self.deliver -= 1;
        if self.initial - self.deliver >= self.credit {
            self.deliver += self.credit;
            return Ok(true);
        }
        Ok(false)
    }
}

/// Circuit-level windows: initial 1000, credit 100.
#[derive(Debug, Clone)]
pub struct CircuitWindows(pub WindowPair);

impl CircuitWindows {
    pub fn new() -> Self {
        Self(WindowPair::new(CIRCUIT_WINDOW_INITIAL, CIRCUIT_SENDME_CREDIT))
    }
}

impl Default for CircuitWindows {
    fn default() -> Self {
        Self::new()
    }
}

/// Stream-level windows: initial 500, credit 50.
#[derive(Debug, Clone)]
pub struct StreamWindows(pub WindowPair);

impl StreamWindows {
    pub fn new() -> Self {
        Self(WindowPair::new(STREAM_WINDOW_INITIAL, STREAM_SENDME_CREDIT))
    }
}

impl Default for StreamWindows {
    fn default() -> Self {
        Self::new()
    }
}
