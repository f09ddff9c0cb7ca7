use crate::ids::DeviceId;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

/// Abstraction over the BLE layer's send path (GATT write, notify, ...),
///  introduced so the protocol stays agnostic of how bytes reach the peer and
///  so the I/O part can be mocked away for testing.
///
/// A returned error means this one frame did not go out; the protocol treats
///  that as transient and recovers via retransmission, it never retries the
///  write inline.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ParcelSink: Send + Sync + 'static {
    async fn send_to(&self, to: DeviceId, frame: &[u8]) -> anyhow::Result<()>;
}
