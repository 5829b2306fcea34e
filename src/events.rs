// events.rs - Scanner notifications
// =========================================================================
//
// Lifecycle events fan out over a tokio broadcast channel. Publishing never
// blocks; a subscriber that falls behind skips the oldest events.

use std::net::IpAddr;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::trace;

/// Why a connected I/O exchange ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed through `close_connection`
    Requested,
    /// Closed automatically after going stale
    Stale,
    /// The scanner shut down
    Shutdown,
}

/// Notifications published by the scanner.
///
/// Front ends subscribe to drive activity indicators instead of passing
/// callbacks into the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum ScannerEvent {
    ExchangeStarted {
        target: IpAddr,
        operation: &'static str,
    },
    ExchangeFinished {
        target: IpAddr,
        operation: &'static str,
        success: bool,
        elapsed: Duration,
    },
    ConnectionOpened {
        target: IpAddr,
        o_to_t_connection_id: u32,
        t_to_o_connection_id: u32,
    },
    /// No datagram arrived for `missed` consecutive RPI ticks
    ConnectionStale { target: IpAddr, missed: u32 },
    /// Datagrams resumed after the connection went stale
    ConnectionRecovered { target: IpAddr },
    ConnectionClosed { target: IpAddr, reason: CloseReason },
}

/// Fan-out channel for [`ScannerEvent`]s
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ScannerEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ScannerEvent> {
        self.tx.subscribe()
    }

    /// Publishes an event; having no subscribers is not an error
    pub fn publish(&self, event: ScannerEvent) {
        trace!("event: {:?}", event);
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn test_publish_without_and_with_subscribers() {
        let bus = EventBus::new(4);
        let target = IpAddr::V4(Ipv4Addr::LOCALHOST);
        bus.publish(ScannerEvent::ConnectionRecovered { target });

        let mut rx = bus.subscribe();
        bus.publish(ScannerEvent::ConnectionStale { target, missed: 3 });
        assert_eq!(
            rx.recv().await.unwrap(),
            ScannerEvent::ConnectionStale { target, missed: 3 }
        );
    }
}
