mod stack;
pub use stack::{
    Advertisement, Attribute, ConnectionHandle, DiscoverKind, DiscoverRequest, GattStack,
    StackError, StackEvent, SubscribeRequest,
};

mod discovery;
pub use discovery::{DiscoveryCursor, DiscoveryPhase, GattTargets, Step};

mod relay;
pub use relay::{strip_frame, NotificationRelay, RelayError, MAX_NOTIFICATION_LEN};

mod session;
pub use session::{CentralSession, LinkState, SubscriptionHandle};

mod bluez;
pub use bluez::BluezStack;

#[cfg(test)]
mod mock;

pub const SERVICE_UUID: u16 = 0xff00;
pub const CHARACTERISTIC_UUID: u16 = 0xff01;
/// Client characteristic configuration descriptor.
pub const CCC_UUID: u16 = 0x2902;

pub const FIRST_ATTRIBUTE_HANDLE: u16 = 0x0001;
pub const LAST_ATTRIBUTE_HANDLE: u16 = 0xffff;
