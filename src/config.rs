//! Compile-time configuration of queue depths and protocol limits.

use embassy_time::Duration;

/// Default ATT MTU before any Exchange MTU procedure has run.
pub const ATT_DEFAULT_MTU: u16 = 23;

/// The MTU this server is willing to receive. Capped at the largest
/// attribute value (512) plus the ATT read header.
pub const ATT_SERVER_RX_MTU: u16 = 517;

/// Largest attribute value the stack will store or transfer.
pub const ATT_MAX_VALUE_LEN: usize = 512;

/// ATT requests and indications that go unanswered for this long poison
/// the bearer.
pub const ATT_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum number of queued prepare writes per connection.
pub const PREPARE_WRITE_QUEUE_SIZE: usize = 128;

/// Depth of the inbound ATT PDU queue shared by all connections.
pub const ATT_RX_QUEUE_SIZE: usize = 8;

/// Depth of the scanner report queue.
pub const SCAN_QUEUE_SIZE: usize = 4;

/// Depth of the per-connection event queue.
pub const CONNECTION_EVENT_QUEUE_SIZE: usize = 4;

/// Number of queued HCI commands awaiting their turn on the wire.
pub const COMMAND_QUEUE_SIZE: usize = 8;

/// Number of simultaneous ACL connections the adapter tracks.
pub const MAX_CONNECTIONS: usize = 8;

/// Depth of the per-connection notification/indication queue on the
/// client side.
pub const NOTIFICATION_QUEUE_SIZE: usize = 8;

/// Controllers advertise ACL payloads up to this size; larger claims are
/// clamped to stay within the 2-byte length field of known controllers.
pub const ACL_MTU_CAP: u16 = 1023;

/// Capacity of the unbonded GATT cache FIFO in the persistence store.
pub const UNBONDED_GATT_CACHE_CAP: usize = 50;
