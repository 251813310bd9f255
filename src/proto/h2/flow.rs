//! Flow-control windows (RFC 7540 §5.2).

use super::frame::Reason;

/// Largest legal window: 2^31 - 1.
pub const MAX_WINDOW: i64 = (1 << 31) - 1;

/// One window, stream- or connection-scoped. Windows can go negative
/// when `SETTINGS_INITIAL_WINDOW_SIZE` shrinks mid-stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowWindow {
    available: i64,
}

impl FlowWindow {
    pub fn new(initial: u32) -> FlowWindow {
        FlowWindow {
            available: initial as i64,
        }
    }

    pub fn available(&self) -> i64 {
        self.available
    }

    /// Bytes that may be sent right now.
    pub fn sendable(&self) -> u64 {
        self.available.max(0) as u64
    }

    /// Consumes window for sent payload; callers must not overshoot.
    pub fn consume(&mut self, n: u64) {
        debug_assert!(n <= self.sendable());
        self.available -= n as i64;
    }

    /// Applies a WINDOW_UPDATE increment.
    pub fn grow(&mut self, n: u32) -> Result<(), Reason> {
        if n == 0 {
            return Err(Reason::Protocol);
        }
        let next = self.available + n as i64;
        if next > MAX_WINDOW {
            return Err(Reason::FlowControl);
        }
        self.available = next;
        Ok(())
    }

    /// Applies an initial-window-size delta from SETTINGS.
    pub fn adjust(&mut self, delta: i64) -> Result<(), Reason> {
        let next = self.available + delta;
        if next > MAX_WINDOW {
            return Err(Reason::FlowControl);
        }
        self.available = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consume_and_replenish() {
        let mut window = FlowWindow::new(10);
        window.consume(10);
        assert_eq!(window.sendable(), 0);
        window.grow(4).unwrap();
        assert_eq!(window.sendable(), 4);
    }

    #[test]
    fn zero_increment_is_a_protocol_error() {
        let mut window = FlowWindow::new(10);
        assert_eq!(window.grow(0).unwrap_err(), Reason::Protocol);
    }

    #[test]
    fn overflow_is_a_flow_control_error() {
        let mut window = FlowWindow::new(u32::MAX >> 1);
        assert_eq!(window.grow(u32::MAX >> 1).unwrap_err(), Reason::FlowControl);
    }

    #[test]
    fn settings_shrink_can_go_negative() {
        let mut window = FlowWindow::new(100);
        window.consume(80);
        window.adjust(-50).unwrap();
        assert_eq!(window.available(), -30);
        assert_eq!(window.sendable(), 0);
        window.grow(40).unwrap();
        assert_eq!(window.sendable(), 10);
    }
}
