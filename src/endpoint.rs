use crate::config::ParcelConfig;
use crate::frame::FrameKind;
use crate::housekeeping::Housekeeping;
use crate::ids::DeviceId;
use crate::message_dispatcher::MessageDispatcher;
use crate::parcel::{DataParcel, HeaderParcel};
use crate::parcel_sink::ParcelSink;
use crate::reassembly::ReassemblyBuffer;
use crate::receipt::Receipt;
use crate::send_pipeline::{OutgoingMessage, SendPipeline};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::warn;

/// The protocol's top-level object, wiring the outgoing pipeline and the
///  incoming reassembly together over a shared transport.
///
/// The BLE layer pushes every received frame into [ParcelEndpoint::on_frame_received]
///  and provides the send path through the [crate::parcel_sink::ParcelSink] it
///  was created with; everything else is internal.
#[derive(Clone)]
pub struct ParcelEndpoint {
    config: Arc<ParcelConfig>,
    send_pipeline: SendPipeline,
    reassembly: ReassemblyBuffer,
}

impl ParcelEndpoint {
    pub fn new(
        config: ParcelConfig,
        sink: Arc<dyn ParcelSink>,
        dispatcher: Arc<dyn MessageDispatcher>,
    ) -> anyhow::Result<ParcelEndpoint> {
        config.validate()?;
        let config = Arc::new(config);
        Ok(ParcelEndpoint {
            config: config.clone(),
            send_pipeline: SendPipeline::new(config.clone(), sink.clone(), dispatcher.clone()),
            reassembly: ReassemblyBuffer::new(config, sink, dispatcher),
        })
    }

    /// Entry point for raw frames from the transport. Malformed frames are
    ///  logged and dropped - on a lossy radio link they are business as usual,
    ///  and retransmission recovers whatever they were carrying.
    pub async fn on_frame_received(&self, from: DeviceId, frame: &[u8]) {
        let buf = &mut &frame[..];

        let kind = match FrameKind::deser(buf) {
            Ok(kind) => kind,
            Err(e) => {
                warn!("received unintelligible frame from {}: {:#} - discarding", from, e);
                return;
            }
        };

        match kind {
            FrameKind::Header => match HeaderParcel::deser(buf) {
                Ok(header) => self.reassembly.on_header(from, header).await,
                Err(e) => warn!("received malformed header parcel from {}: {:#} - discarding", from, e),
            },
            FrameKind::Data => match DataParcel::deser(buf) {
                Ok(parcel) => self.reassembly.on_data(from, parcel).await,
                Err(e) => warn!("received malformed data parcel from {}: {:#} - discarding", from, e),
            },
            FrameKind::Receipt => match Receipt::deser(buf) {
                Ok(receipt) => self.send_pipeline.on_receipt(from, receipt).await,
                Err(e) => warn!("received malformed receipt from {}: {:#} - discarding", from, e),
            },
        }
    }

    /// Queues a message for transmission. `true` means accepted into the
    ///  queue, not delivered - delivery failure surfaces asynchronously
    ///  through [MessageDispatcher::on_send_failed].
    pub async fn send(&self, message: OutgoingMessage) -> bool {
        self.send_pipeline.enqueue(message).await
    }

    pub async fn queue_len(&self, device: &DeviceId) -> usize {
        self.send_pipeline.queue_len(device).await
    }

    pub async fn is_sending(&self, device: &DeviceId) -> bool {
        self.send_pipeline.is_sending(device).await
    }

    /// Discards all protocol state for one device, in both directions. Meant
    ///  for when the BLE layer reports the device gone.
    pub async fn cancel_device(&self, device: &DeviceId) {
        self.send_pipeline.cancel_device(device).await;
        self.reassembly.cancel_device(device).await;
    }

    /// Starts the periodic housekeeping loop. The caller owns the handle and
    ///  aborts it on shutdown.
    pub fn spawn_housekeeping(&self) -> JoinHandle<()> {
        Housekeeping::new(
            self.config.clone(),
            self.send_pipeline.clone(),
            self.reassembly.clone(),
        ).spawn()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{decode_frame, ChannelSink, DecodedFrame, RecordingDispatcher, RecordingSink};
    use bytes::BytesMut;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::sleep;

    fn endpoint_with_defaults() -> (ParcelEndpoint, Arc<RecordingSink>, Arc<RecordingDispatcher>) {
        let sink = Arc::new(RecordingSink::default());
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let endpoint = ParcelEndpoint::new(ParcelConfig::default(), sink.clone(), dispatcher.clone()).unwrap();
        (endpoint, sink, dispatcher)
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let sink = Arc::new(RecordingSink::default());
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let config = ParcelConfig {
            max_parcel_payload: 0,
            ..ParcelConfig::default()
        };
        assert!(ParcelEndpoint::new(config, sink, dispatcher).is_err());
    }

    #[tokio::test]
    async fn test_garbage_frames_are_dropped() {
        let (endpoint, sink, dispatcher) = endpoint_with_defaults();
        let from = DeviceId::from("peer");

        endpoint.on_frame_received(from.clone(), &[]).await;
        endpoint.on_frame_received(from.clone(), &[0xff, 1, 2, 3]).await;
        // valid kind byte, truncated body
        endpoint.on_frame_received(from.clone(), &[1, 0, 0]).await;

        assert_eq!(sink.frame_count(), 0);
        assert!(dispatcher.completed().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_receipt_frames_reach_the_send_pipeline() {
        let (endpoint, sink, _dispatcher) = endpoint_with_defaults();
        let device = DeviceId::from("peer");

        let message = OutgoingMessage::new(device.clone(), vec![1; 200]);
        let msg_id = message.msg_id;
        assert!(endpoint.send(message).await);

        while sink.frame_count() < 3 {
            sleep(Duration::from_millis(5)).await;
        }

        let mut buf = BytesMut::new();
        Receipt::complete(msg_id).ser(&mut buf);
        endpoint.on_frame_received(device.clone(), &buf).await;

        while endpoint.is_sending(&device).await {
            sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(endpoint.queue_len(&device).await, 0);
    }

    /// Two endpoints wired back to back through channels, with a fault
    ///  injected into one direction.
    struct Loopback {
        sender: ParcelEndpoint,
        sender_dispatcher: Arc<RecordingDispatcher>,
        receiver_dispatcher: Arc<RecordingDispatcher>,
    }

    fn spawn_pump(
        mut rx: mpsc::UnboundedReceiver<(DeviceId, Vec<u8>)>,
        destination: ParcelEndpoint,
        source_id: DeviceId,
        fault: Option<Arc<dyn Fn(&mut Vec<u8>) -> bool + Send + Sync>>,
    ) {
        tokio::spawn(async move {
            while let Some((_, mut frame)) = rx.recv().await {
                if let Some(fault) = &fault {
                    if fault(&mut frame) {
                        continue;
                    }
                }
                destination.on_frame_received(source_id.clone(), &frame).await;
            }
        });
    }

    /// `fault` runs on every sender→receiver frame; returning `true` drops it.
    fn loopback(fault: Option<Arc<dyn Fn(&mut Vec<u8>) -> bool + Send + Sync>>) -> Loopback {
        let device_a = DeviceId::from("device-a");
        let device_b = DeviceId::from("device-b");

        let (a_to_b_tx, a_to_b_rx) = mpsc::unbounded_channel();
        let (b_to_a_tx, b_to_a_rx) = mpsc::unbounded_channel();

        let sender_config = ParcelConfig {
            max_parcel_payload: 100,
            inter_parcel_delay: Duration::from_millis(10),
            receipt_timeout: Duration::from_secs(30),
            ..ParcelConfig::default()
        };
        let receiver_config = ParcelConfig {
            missing_parcel_request_delay: Duration::from_secs(1),
            housekeeping_interval: Duration::from_secs(2),
            ..ParcelConfig::default()
        };

        let sender_dispatcher = Arc::new(RecordingDispatcher::default());
        let sender = ParcelEndpoint::new(
            sender_config,
            Arc::new(ChannelSink::new(a_to_b_tx)),
            sender_dispatcher.clone(),
        ).unwrap();

        let receiver_dispatcher = Arc::new(RecordingDispatcher::default());
        let receiver = ParcelEndpoint::new(
            receiver_config,
            Arc::new(ChannelSink::new(b_to_a_tx)),
            receiver_dispatcher.clone(),
        ).unwrap();

        receiver.spawn_housekeeping();

        spawn_pump(a_to_b_rx, receiver, device_a, fault);
        spawn_pump(b_to_a_rx, sender.clone(), device_b, None);

        Loopback {
            sender,
            sender_dispatcher,
            receiver_dispatcher,
        }
    }

    async fn completed_payload(lb: &Loopback) -> Vec<u8> {
        while lb.receiver_dispatcher.completed().is_empty() {
            sleep(Duration::from_millis(10)).await;
        }
        lb.receiver_dispatcher.completed().remove(0).3
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_to_end_lossless() {
        let lb = loopback(None);
        let payload = (0..1000u32).map(|i| i as u8).collect::<Vec<_>>();

        assert!(lb.sender.send(OutgoingMessage::new(DeviceId::from("device-b"), payload.clone())).await);

        assert_eq!(completed_payload(&lb).await, payload);
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_to_end_recovers_from_a_lost_parcel() {
        // drop the first copy of data parcel 3; the receiver's proactive
        //  missing-parcel request triggers the selective resend
        let drops = Arc::new(AtomicUsize::new(0));
        let fault = {
            let drops = drops.clone();
            Arc::new(move |frame: &mut Vec<u8>| {
                if let Ok(DecodedFrame::Data(d)) = decode_frame(frame) {
                    if d.parcel_num == 3 && drops.fetch_add(1, Ordering::SeqCst) == 0 {
                        return true;
                    }
                }
                false
            }) as Arc<dyn Fn(&mut Vec<u8>) -> bool + Send + Sync>
        };

        let lb = loopback(Some(fault));
        let payload = vec![0xabu8; 1000];

        assert!(lb.sender.send(OutgoingMessage::new(DeviceId::from("device-b"), payload.clone())).await);

        assert_eq!(completed_payload(&lb).await, payload);
        assert_eq!(drops.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_to_end_recovers_from_corruption() {
        // corrupt one byte of the first data parcel, once; the checksum gate
        //  rejects the reassembled message and a full resend repairs it
        let corrupted = Arc::new(AtomicUsize::new(0));
        let fault = {
            let corrupted = corrupted.clone();
            Arc::new(move |frame: &mut Vec<u8>| {
                if let Ok(DecodedFrame::Data(d)) = decode_frame(frame) {
                    if d.parcel_num == 0 && corrupted.fetch_add(1, Ordering::SeqCst) == 0 {
                        let last = frame.len() - 1;
                        frame[last] ^= 0xff;
                    }
                }
                false
            }) as Arc<dyn Fn(&mut Vec<u8>) -> bool + Send + Sync>
        };

        let lb = loopback(Some(fault));
        let payload = vec![0x17u8; 500];

        assert!(lb.sender.send(OutgoingMessage::new(DeviceId::from("device-b"), payload.clone())).await);

        assert_eq!(completed_payload(&lb).await, payload);
        assert_eq!(corrupted.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_to_end_empty_message() {
        let lb = loopback(None);

        let message = OutgoingMessage::new(DeviceId::from("device-b"), Vec::new());
        let msg_id = message.msg_id;
        assert!(lb.sender.send(message).await);

        assert_eq!(completed_payload(&lb).await, Vec::<u8>::new());
        assert_eq!(lb.receiver_dispatcher.completed()[0].1, msg_id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_to_end_reports_send_failure() {
        // the sender→receiver direction is completely dead, so every attempt
        //  times out and the message is eventually reported as failed
        let fault = Arc::new(|_: &mut Vec<u8>| true) as Arc<dyn Fn(&mut Vec<u8>) -> bool + Send + Sync>;
        let lb = loopback(Some(fault));

        let message = OutgoingMessage::new(DeviceId::from("device-b"), vec![6u8; 300]);
        let msg_id = message.msg_id;
        assert!(lb.sender.send(message).await);

        while lb.sender_dispatcher.failed().is_empty() {
            sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(lb.sender_dispatcher.failed(), vec![(DeviceId::from("device-b"), msg_id)]);
        assert!(lb.receiver_dispatcher.completed().is_empty());
    }
}
