//! Frame coalescing and publishing.
//!
//! At most one progress frame every two seconds; intervening updates keep
//! only the latest content. Publishing is one-sided: a failed send drops
//! the frame and the next one is scheduled, so the worker never blocks on
//! the bus.

use std::time::{Duration, Instant};

use pgbus::{MessageBus, SendOptions};
use tracing::warn;

use crate::types::{ProgressFrame, THREAD_RESPONSE_QUEUE};

pub const COALESCE_INTERVAL: Duration = Duration::from_secs(2);

/// Keep-latest transducer over the frame stream.
#[derive(Debug)]
pub struct FrameCoalescer {
    interval: Duration,
    last_emitted_at: Option<Instant>,
    pending: Option<ProgressFrame>,
}

impl FrameCoalescer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_emitted_at: None,
            pending: None,
        }
    }

    /// Offer a frame; returns it if it should be published now.
    ///
    /// Terminal frames always pass through. Within the interval the frame
    /// is held as the pending latest, replacing whatever was there.
    pub fn offer(&mut self, frame: ProgressFrame) -> Option<ProgressFrame> {
        self.offer_at(frame, Instant::now())
    }

    fn offer_at(&mut self, frame: ProgressFrame, now: Instant) -> Option<ProgressFrame> {
        if frame.is_done {
            self.pending = None;
            self.last_emitted_at = Some(now);
            return Some(frame);
        }

        match self.last_emitted_at {
            Some(last) if now.duration_since(last) < self.interval => {
                self.pending = Some(frame);
                None
            }
            _ => {
                self.last_emitted_at = Some(now);
                self.pending = None;
                Some(frame)
            }
        }
    }

    /// Take the pending frame if its window has elapsed.
    pub fn due(&mut self) -> Option<ProgressFrame> {
        self.due_at(Instant::now())
    }

    fn due_at(&mut self, now: Instant) -> Option<ProgressFrame> {
        let last = self.last_emitted_at?;
        if self.pending.is_some() && now.duration_since(last) >= self.interval {
            self.last_emitted_at = Some(now);
            return self.pending.take();
        }
        None
    }
}

/// Fire-and-forget frame publisher.
#[derive(Clone)]
pub struct FramePublisher {
    bus: MessageBus,
}

impl FramePublisher {
    pub fn new(bus: MessageBus) -> Self {
        Self { bus }
    }

    /// Publish a frame; a send failure is logged and the frame dropped.
    pub async fn publish(&self, frame: &ProgressFrame) {
        if let Err(e) = self
            .bus
            .send(THREAD_RESPONSE_QUEUE, frame, SendOptions::default())
            .await
        {
            warn!(
                thread_ts = %frame.thread_ts,
                error = %e,
                "dropping progress frame, bus send failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AgentOptions, InboundMessage};

    fn frame(content: &str) -> ProgressFrame {
        ProgressFrame::progress(&sample_message(), content)
    }

    fn sample_message() -> InboundMessage {
        InboundMessage {
            user_id: "U1".into(),
            thread_id: "T1".into(),
            channel_id: "C1".into(),
            message_id: "M1".into(),
            message_text: "hello".into(),
            original_message_ts: "M1".into(),
            placeholder_ts: "P1".into(),
            platform_metadata: serde_json::Value::Null,
            agent_options: AgentOptions::default(),
        }
    }

    #[test]
    fn first_frame_emits_immediately() {
        let mut coalescer = FrameCoalescer::new(COALESCE_INTERVAL);
        assert!(coalescer.offer_at(frame("step-1"), Instant::now()).is_some());
    }

    #[test]
    fn frames_within_window_keep_only_latest() {
        let mut coalescer = FrameCoalescer::new(COALESCE_INTERVAL);
        let start = Instant::now();

        assert!(coalescer.offer_at(frame("step-1"), start).is_some());
        for i in 2..=9 {
            assert!(coalescer
                .offer_at(frame(&format!("step-{i}")), start + Duration::from_millis(i * 100))
                .is_none());
        }

        // Nothing due inside the window…
        assert!(coalescer.due_at(start + Duration::from_secs(1)).is_none());
        // …and only the latest survives once it elapses.
        let due = coalescer.due_at(start + Duration::from_secs(2)).unwrap();
        assert_eq!(due.content.as_deref(), Some("step-9"));
        assert!(coalescer.due_at(start + Duration::from_secs(2)).is_none());
    }

    #[test]
    fn frame_after_window_emits_directly() {
        let mut coalescer = FrameCoalescer::new(COALESCE_INTERVAL);
        let start = Instant::now();

        assert!(coalescer.offer_at(frame("a"), start).is_some());
        assert!(coalescer
            .offer_at(frame("b"), start + Duration::from_secs(3))
            .is_some());
    }

    #[test]
    fn terminal_frame_bypasses_coalescing() {
        let mut coalescer = FrameCoalescer::new(COALESCE_INTERVAL);
        let start = Instant::now();

        assert!(coalescer.offer_at(frame("progress"), start).is_some());
        assert!(coalescer
            .offer_at(frame("buffered"), start + Duration::from_millis(100))
            .is_none());

        let terminal = ProgressFrame::done(&sample_message(), "final");
        let emitted = coalescer
            .offer_at(terminal, start + Duration::from_millis(200))
            .unwrap();
        assert!(emitted.is_done);

        // The buffered intermediate frame is discarded, not replayed.
        assert!(coalescer.due_at(start + Duration::from_secs(10)).is_none());
    }
}
