use std::collections::BTreeSet;

use bit_set::BitSet;
use tracing::{debug, trace};

use crate::metrics::DropCause;
use crate::source::Frame;
use crate::wire::media::{MediaPacket, END_OF_STREAM_FRAME_ID};
use crate::wire::ConnId;

/// Classification of one arrived or missing frame id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameRecord {
    Delivered,
    Duplicate,
    Late,
    Corrupt,
    Lost,
}

impl FrameRecord {
    /// `None` for delivered frames
    pub fn drop_cause(self) -> Option<DropCause> {
        match self {
            FrameRecord::Delivered => None,
            FrameRecord::Duplicate => Some(DropCause::Duplicate),
            FrameRecord::Late => Some(DropCause::Late),
            FrameRecord::Corrupt => Some(DropCause::Corrupt),
            FrameRecord::Lost => Some(DropCause::Lost),
        }
    }
}

/// The detector's verdict on one incoming packet
#[derive(Debug, Clone, PartialEq)]
pub enum Detection {
    /// The frame advances the stream. `lost` is the number of ids skipped over since the
    ///  previous delivered frame, not counting those that arrived corrupt.
    Delivered { frame: Frame, lost: u32 },
    Rejected { frame_id: u32, record: FrameRecord },
    /// not part of the active session, arrived after the end of stream, or a late copy of a
    ///  frame that was counted as lost or corrupt already
    Discarded,
    EndOfStream,
}

/// Classifies the media packets of one session as they arrive. Lost frames are never
///  recovered: once a higher id was delivered, the gap below it is final.
pub struct LossDetector {
    conn_id: ConnId,
    highest_delivered: Option<u32>,
    /// ring of the most recent ids, bit set iff delivered
    recent: BitSet,
    /// same ring, bit set iff the id was skipped and counted as lost or corrupt
    accounted: BitSet,
    /// ids above the highest delivered one that arrived corrupt, so they are not counted as
    ///  lost a second time
    corrupt_ahead: BTreeSet<u32>,
    finished: bool,
}

impl LossDetector {
    /// How far below the highest delivered id duplicates can be told apart from late frames
    const HISTORY_LEN: u32 = 1024;

    /// Presentation timestamps beyond one day are treated as a damaged header
    pub const MAX_PTS_MS: f32 = 86_400_000.0;

    pub fn new(conn_id: ConnId) -> LossDetector {
        LossDetector {
            conn_id,
            highest_delivered: None,
            recent: BitSet::with_capacity(Self::HISTORY_LEN as usize),
            accounted: BitSet::with_capacity(Self::HISTORY_LEN as usize),
            corrupt_ahead: BTreeSet::new(),
            finished: false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn on_packet(&mut self, packet: MediaPacket) -> Detection {
        if packet.conn_id != self.conn_id {
            debug!("packet for foreign session {} - dropping", packet.conn_id);
            return Detection::Discarded;
        }
        if self.finished {
            debug!("frame #{} after end of stream - dropping", packet.frame_id);
            return Detection::Discarded;
        }
        if let Err(e) = packet.verify_checksum() {
            debug!("frame #{} is corrupt ({}) - dropping", packet.frame_id, e);
            self.remember_corrupt(packet.frame_id);
            return Detection::Rejected { frame_id: packet.frame_id, record: FrameRecord::Corrupt };
        }
        if packet.is_end_of_stream() {
            trace!("end of stream");
            self.finished = true;
            return Detection::EndOfStream;
        }
        // the checksum covers the payload only
        if !(packet.pts_ms.is_finite() && (0.0..=Self::MAX_PTS_MS).contains(&packet.pts_ms)) {
            debug!("frame #{} has an invalid pts of {} - dropping", packet.frame_id, packet.pts_ms);
            self.remember_corrupt(packet.frame_id);
            return Detection::Rejected { frame_id: packet.frame_id, record: FrameRecord::Corrupt };
        }

        let expected = self.highest_delivered.map(|h| h + 1).unwrap_or(0);
        if packet.frame_id < expected {
            let record = match self.history(packet.frame_id) {
                Some(true) => FrameRecord::Duplicate,
                Some(false) => {
                    debug!("frame #{} arrived after it was counted as dropped - ignoring", packet.frame_id);
                    return Detection::Discarded;
                }
                None => FrameRecord::Late,
            };
            debug!("frame #{} is {:?} - dropping", packet.frame_id, record);
            return Detection::Rejected { frame_id: packet.frame_id, record };
        }

        let num_corrupt = self.corrupt_ahead.range(expected..packet.frame_id).count() as u32;
        let lost = packet.frame_id - expected - num_corrupt;
        if lost > 0 {
            debug!("{} frame(s) between #{} and #{} lost", lost, expected, packet.frame_id);
        }
        self.corrupt_ahead = self.corrupt_ahead.split_off(&(packet.frame_id + 1));
        self.mark_delivered(expected, packet.frame_id);

        Detection::Delivered {
            frame: Frame {
                frame_id: packet.frame_id,
                pts_ms: packet.pts_ms,
                data: packet.data,
            },
            lost,
        }
    }

    fn remember_corrupt(&mut self, frame_id: u32) {
        if frame_id < self.highest_delivered.map(|h| h + 1).unwrap_or(0) || frame_id == END_OF_STREAM_FRAME_ID {
            return;
        }
        if self.corrupt_ahead.len() >= Self::HISTORY_LEN as usize {
            self.corrupt_ahead.pop_last();
        }
        self.corrupt_ahead.insert(frame_id);
    }

    fn slot(frame_id: u32) -> usize {
        (frame_id % Self::HISTORY_LEN) as usize
    }

    /// For an id below the highest delivered one: `Some(true)` if it was delivered,
    ///  `Some(false)` if it was skipped and counted, `None` if it is too old to tell
    fn history(&self, frame_id: u32) -> Option<bool> {
        match self.highest_delivered {
            Some(highest) if highest - frame_id < Self::HISTORY_LEN => {
                let slot = Self::slot(frame_id);
                if self.recent.contains(slot) {
                    Some(true)
                }
                else {
                    self.accounted.contains(slot).then_some(false)
                }
            }
            _ => None,
        }
    }

    /// marks the skipped ids `expected..frame_id` as counted, and `frame_id` as delivered
    fn mark_delivered(&mut self, expected: u32, frame_id: u32) {
        let num_skipped = (frame_id - expected).min(Self::HISTORY_LEN);
        for offset in 0..num_skipped {
            let slot = Self::slot(frame_id - 1 - offset);
            self.recent.remove(slot);
            self.accounted.insert(slot);
        }
        let slot = Self::slot(frame_id);
        self.recent.insert(slot);
        self.accounted.remove(slot);
        self.highest_delivered = Some(frame_id);
    }
}
