use std::cmp::Ordering;
use std::collections::VecDeque;

use tracing::{debug, error, warn};

use crate::wmb::WMB;

/// OffsetTimeline keeps the most recent WMBs of one processor for one partition, sorted from the
/// highest watermark to the lowest. The front is the head WMB.
#[derive(Debug, Clone)]
pub(crate) struct OffsetTimeline {
    entries: VecDeque<WMB>,
    capacity: usize,
}

impl OffsetTimeline {
    pub(crate) fn new(capacity: usize) -> Self {
        OffsetTimeline {
            entries: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Inserts the WMB keeping the timeline sorted, out of order WMBs are dropped.
    pub(crate) fn put(&mut self, wmb: WMB) {
        let Some(head) = self.entries.front_mut() else {
            self.entries.push_front(wmb);
            return;
        };

        match (
            wmb.watermark.cmp(&head.watermark),
            wmb.offset.cmp(&head.offset),
        ) {
            // same watermark, later offset or an idle flip of the same position
            (Ordering::Equal, Ordering::Greater | Ordering::Equal) => {
                *head = wmb;
            }
            (Ordering::Equal, Ordering::Less) => {
                warn!(
                    ?wmb,
                    ?head,
                    "Watermark the same but input offset smaller than the existing offset - skipping"
                );
            }
            (Ordering::Greater, Ordering::Greater) => self.push_head(wmb),
            // idling moves the watermark without any new data
            (Ordering::Greater, Ordering::Equal) if wmb.idle => self.push_head(wmb),
            (Ordering::Greater, _) => {
                error!(?wmb, ?head, "The new input offset should never be smaller than the existing offset");
            }
            (Ordering::Less, _) => {
                debug!(?wmb, ?head, "Watermark smaller than the head watermark - skipping");
            }
        }
    }

    fn push_head(&mut self, wmb: WMB) {
        self.entries.push_front(wmb);
        self.entries.truncate(self.capacity);
    }

    pub(crate) fn head_wmb(&self) -> Option<WMB> {
        self.entries.front().copied()
    }

    /// Watermark of the head WMB, -1 if nothing was published yet.
    pub(crate) fn head_watermark(&self) -> i64 {
        self.entries.front().map_or(-1, |w| w.watermark)
    }

    pub(crate) fn head_offset(&self) -> i64 {
        self.entries.front().map_or(-1, |w| w.offset)
    }

    /// Event time of the nearest WMB with an offset smaller than the input offset, -1 if none.
    pub(crate) fn event_time(&self, input_offset: i64) -> i64 {
        self.entries
            .iter()
            .find(|w| w.offset < input_offset)
            .map_or(-1, |w| w.watermark)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wmb(watermark: i64, offset: i64, idle: bool) -> WMB {
        WMB {
            idle,
            offset,
            watermark,
        }
    }

    #[test]
    fn test_put_offsets_in_order() {
        let mut timeline = OffsetTimeline::new(10);
        assert_eq!(timeline.head_watermark(), -1);
        assert_eq!(timeline.head_offset(), -1);
        assert_eq!(timeline.head_wmb(), None);

        for (watermark, offset) in [(100, 1), (200, 2), (250, 3), (250, 4), (300, 5)] {
            timeline.put(wmb(watermark, offset, false));
        }

        assert_eq!(timeline.head_offset(), 5);
        assert_eq!(timeline.head_watermark(), 300);
        assert_eq!(timeline.event_time(3), 200);
        // (250, 3) got replaced by (250, 4)
        assert_eq!(timeline.len(), 4);
    }

    #[test]
    fn test_put_out_of_order_offsets() {
        let mut timeline = OffsetTimeline::new(10);
        timeline.put(wmb(50, 62, false));
        timeline.put(wmb(100, 65, false));
        timeline.put(wmb(200, 63, false)); // offset went backwards
        timeline.put(wmb(250, 70, false));
        timeline.put(wmb(300, 86, false));

        assert_eq!(timeline.head_offset(), 86);
        assert_eq!(timeline.head_watermark(), 300);
        assert_eq!(timeline.event_time(65), 50);
        assert_eq!(timeline.event_time(62), -1);
    }

    #[test]
    fn test_put_idle_cases() {
        let mut timeline = OffsetTimeline::new(10);
        timeline.put(wmb(100, 1, false));
        timeline.put(wmb(200, 2, false));
        timeline.put(wmb(150, 3, true)); // lower than the head
        assert_eq!(timeline.head_watermark(), 200);

        // the same position flipping to idle
        timeline.put(wmb(200, 2, true));
        assert_eq!(timeline.head_wmb(), Some(wmb(200, 2, true)));

        // idle progress without new data keeps the offset
        timeline.put(wmb(250, 2, true));
        assert_eq!(timeline.head_wmb(), Some(wmb(250, 2, true)));

        // but an active WMB has to move the offset
        timeline.put(wmb(260, 2, false));
        assert_eq!(timeline.head_watermark(), 250);

        timeline.put(wmb(260, 3, false));
        assert_eq!(timeline.head_wmb(), Some(wmb(260, 3, false)));
    }

    #[test]
    fn test_capacity() {
        let mut timeline = OffsetTimeline::new(3);
        for i in 1..=5 {
            timeline.put(wmb(i * 100, i, false));
        }
        assert_eq!(timeline.len(), 3);
        assert_eq!(timeline.event_time(5), 400);
        // entries older than the capacity are gone
        assert_eq!(timeline.event_time(3), -1);
    }
}
