use anyhow::bail;
use std::time::Duration;

/// Tunables for the chunked messaging protocol.
///
/// The defaults are conservative for a BLE link: small parcels so a frame fits
///  a single characteristic write, generous pauses so the peer gets channel
///  time, and retention / timeout windows that are long compared to the time
///  one message normally spends in flight.
pub struct ParcelConfig {
    /// Maximum number of payload bytes per data parcel. Frames must fit the
    ///  negotiated ATT MTU minus this protocol's framing overhead; the
    ///  transport below us does no fragmentation of its own.
    pub max_parcel_payload: usize,

    /// Upper bound for a single message's payload. `enqueue` rejects anything
    ///  bigger outright rather than tying up the link for minutes.
    pub max_message_size: usize,

    /// How often a message-level send attempt (a full burst plus the wait for
    ///  its receipt) may fail with a receipt timeout before the message is
    ///  dropped and reported as failed.
    pub max_retries: u32,

    /// How many `missing` / `checksumFailed` triggered resend cycles are
    ///  allowed within one send attempt before the attempt is considered
    ///  failed. Keeps a receiver that keeps reporting loss from pinning the
    ///  sender loop forever.
    pub max_resend_cycles: u32,

    /// Pause between two consecutive parcel writes within a burst.
    pub inter_parcel_delay: Duration,

    /// Length of the listen window: a deliberate transmission pause that
    ///  yields channel time to the peer, since the link cannot sustain
    ///  full-duplex throughput.
    pub listen_window: Duration,

    /// Number of parcels sent back-to-back before a listen window is inserted.
    pub parcels_before_pause: u32,

    /// Bounded wait for the receipt correlated to a burst.
    pub receipt_timeout: Duration,

    /// How long a fully-encoded sent message is retained to answer delayed
    ///  retransmission requests.
    pub sent_message_retention: Duration,

    /// How long an incomplete incoming message may sit without progress
    ///  before housekeeping proactively requests its missing parcels. Also
    ///  the minimum spacing between two such requests for the same message.
    pub missing_parcel_request_delay: Duration,

    /// After this long without an accepted parcel, an incomplete incoming
    ///  message is abandoned and silently dropped.
    pub incomplete_message_timeout: Duration,

    /// Interval of the periodic housekeeping sweep.
    pub housekeeping_interval: Duration,
}

impl Default for ParcelConfig {
    fn default() -> Self {
        ParcelConfig {
            max_parcel_payload: 150,
            max_message_size: 1024 * 1024,
            max_retries: 3,
            max_resend_cycles: 5,
            inter_parcel_delay: Duration::from_millis(100),
            listen_window: Duration::from_millis(500),
            parcels_before_pause: 10,
            receipt_timeout: Duration::from_secs(10),
            sent_message_retention: Duration::from_secs(120),
            missing_parcel_request_delay: Duration::from_secs(5),
            incomplete_message_timeout: Duration::from_secs(60),
            housekeeping_interval: Duration::from_secs(10),
        }
    }
}

impl ParcelConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_parcel_payload == 0 {
            bail!("max_parcel_payload must be positive");
        }
        if self.max_message_size < self.max_parcel_payload {
            bail!("max_message_size is smaller than a single parcel payload");
        }
        if self.max_retries == 0 {
            bail!("max_retries must be positive");
        }
        if self.max_resend_cycles == 0 {
            bail!("max_resend_cycles must be positive");
        }
        if self.parcels_before_pause == 0 {
            bail!("parcels_before_pause must be positive");
        }
        if self.missing_parcel_request_delay >= self.incomplete_message_timeout {
            bail!("missing_parcel_request_delay must be shorter than incomplete_message_timeout, \
                   otherwise a stalled message is abandoned before it is ever nudged");
        }
        Ok(())
    }
}
