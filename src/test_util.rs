use crate::frame::FrameKind;
use crate::ids::{DeviceId, MessageId};
use crate::message_dispatcher::MessageDispatcher;
use crate::parcel::{CompressionAlgorithm, DataParcel, HeaderParcel};
use crate::parcel_sink::ParcelSink;
use crate::receipt::Receipt;
use anyhow::bail;
use async_trait::async_trait;
use std::sync::Mutex;
use tokio::sync::mpsc::UnboundedSender;

/// Decoded view of a captured wire frame, for test assertions.
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum DecodedFrame {
    Header(HeaderParcel),
    Data(DataParcel),
    Receipt(Receipt),
}

pub fn decode_frame(frame: &[u8]) -> anyhow::Result<DecodedFrame> {
    let buf = &mut &frame[..];
    match FrameKind::deser(buf)? {
        FrameKind::Header => Ok(DecodedFrame::Header(HeaderParcel::deser(buf)?)),
        FrameKind::Data => Ok(DecodedFrame::Data(DataParcel::deser(buf)?)),
        FrameKind::Receipt => Ok(DecodedFrame::Receipt(Receipt::deser(buf)?)),
    }
}

/// A `ParcelSink` that records every frame it is asked to send, optionally
///  failing a bounded number of sends that match a predicate.
#[derive(Default)]
pub struct RecordingSink {
    frames: Mutex<Vec<(DeviceId, Vec<u8>)>>,
    fail_matching: Mutex<Option<(fn(&DecodedFrame) -> bool, usize)>>,
}

impl RecordingSink {
    /// the next `count` sends whose frame matches `predicate` fail with an error
    pub fn fail_next_matching(&self, predicate: fn(&DecodedFrame) -> bool, count: usize) {
        *self.fail_matching.lock().unwrap() = Some((predicate, count));
    }

    pub fn frame_count(&self) -> usize {
        self.frames.lock().unwrap().len()
    }

    pub fn frames(&self) -> Vec<(DeviceId, Vec<u8>)> {
        self.frames.lock().unwrap().clone()
    }

    pub fn decoded(&self) -> Vec<DecodedFrame> {
        self.frames.lock().unwrap().iter()
            .map(|(_, frame)| decode_frame(frame).expect("recorded frame should decode"))
            .collect()
    }

    pub fn clear(&self) {
        self.frames.lock().unwrap().clear();
    }
}

#[async_trait]
impl ParcelSink for RecordingSink {
    async fn send_to(&self, to: DeviceId, frame: &[u8]) -> anyhow::Result<()> {
        if let Ok(decoded) = decode_frame(frame) {
            let mut guard = self.fail_matching.lock().unwrap();
            if let Some((predicate, remaining)) = guard.as_mut() {
                if *remaining > 0 && predicate(&decoded) {
                    *remaining -= 1;
                    bail!("simulated send failure");
                }
            }
        }
        self.frames.lock().unwrap().push((to, frame.to_vec()));
        Ok(())
    }
}

/// Dispatcher that records completed-message and send-failed events.
#[derive(Default)]
pub struct RecordingDispatcher {
    completed: Mutex<Vec<(DeviceId, MessageId, Option<CompressionAlgorithm>, Vec<u8>)>>,
    failed: Mutex<Vec<(DeviceId, MessageId)>>,
}

impl RecordingDispatcher {
    pub fn completed(&self) -> Vec<(DeviceId, MessageId, Option<CompressionAlgorithm>, Vec<u8>)> {
        self.completed.lock().unwrap().clone()
    }

    pub fn failed(&self) -> Vec<(DeviceId, MessageId)> {
        self.failed.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageDispatcher for RecordingDispatcher {
    async fn on_message_completed(
        &self,
        source: DeviceId,
        msg_id: MessageId,
        compression: Option<CompressionAlgorithm>,
        payload: Vec<u8>,
    ) {
        self.completed.lock().unwrap().push((source, msg_id, compression, payload));
    }

    async fn on_send_failed(&self, target: DeviceId, msg_id: MessageId) {
        self.failed.lock().unwrap().push((target, msg_id));
    }
}

/// A `ParcelSink` that forwards frames into a channel, for wiring two
///  endpoints back-to-back in tests.
pub struct ChannelSink {
    tx: UnboundedSender<(DeviceId, Vec<u8>)>,
}

impl ChannelSink {
    pub fn new(tx: UnboundedSender<(DeviceId, Vec<u8>)>) -> ChannelSink {
        ChannelSink { tx }
    }
}

#[async_trait]
impl ParcelSink for ChannelSink {
    async fn send_to(&self, to: DeviceId, frame: &[u8]) -> anyhow::Result<()> {
        self.tx.send((to, frame.to_vec())).ok();
        Ok(())
    }
}
