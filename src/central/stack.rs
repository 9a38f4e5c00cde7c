//! The narrow surface of the wireless stack the central session drives.
//!
//! Requests are issued synchronously and only report whether they could be
//! started. Their completion comes back later as a [`StackEvent`], the same
//! way a controller reports through callbacks.

use std::fmt;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionHandle(pub u32);

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

#[derive(Debug, Error)]
pub enum StackError {
    #[error("already subscribed")]
    AlreadySubscribed,
    #[error("connection {0} is not known to the stack")]
    NotConnected(ConnectionHandle),
    #[error("no attribute with handle {0:#06x}")]
    UnknownAttribute(u16),
    #[error("invalid address `{0}`")]
    InvalidAddress(String),
    #[error("scan is not running")]
    NotScanning,
    #[error("bluetooth error: {0}")]
    Bluetooth(#[from] bluer::Error),
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Clone)]
pub struct Advertisement {
    /// Address in the `AA:BB:CC:DD:EE:FF (public)` form.
    pub address: String,
    pub rssi: i16,
    /// Advertising data as length-type-value structures.
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attribute {
    pub handle: u16,
    pub uuid: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoverKind {
    Primary,
    Characteristic,
    Descriptor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoverRequest {
    pub kind: DiscoverKind,
    pub uuid: u16,
    pub start_handle: u16,
    pub end_handle: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscribeRequest {
    pub value_handle: u16,
    pub ccc_handle: u16,
    /// Value written to the configuration descriptor, `0x0001` for notify.
    pub value: u16,
}

#[derive(Debug)]
pub enum StackEvent {
    Advertisement(Advertisement),
    Connected {
        conn: ConnectionHandle,
        status: Result<(), StackError>,
    },
    Disconnected {
        conn: ConnectionHandle,
        reason: String,
    },
    /// `None` signals that the search range held no further match.
    Discovered {
        conn: ConnectionHandle,
        attribute: Option<Attribute>,
    },
    /// `None` signals that the subscription has ended.
    Notification {
        conn: ConnectionHandle,
        value_handle: u16,
        data: Option<Vec<u8>>,
    },
}

pub trait GattStack {
    fn start_scan(&mut self) -> Result<(), StackError>;

    fn stop_scan(&mut self) -> Result<(), StackError>;

    /// Start establishing a connection with default link parameters.
    fn connect(&mut self, address: &str) -> Result<ConnectionHandle, StackError>;

    fn discover(
        &mut self,
        conn: ConnectionHandle,
        request: DiscoverRequest,
    ) -> Result<(), StackError>;

    fn subscribe(
        &mut self,
        conn: ConnectionHandle,
        request: SubscribeRequest,
    ) -> Result<(), StackError>;

    /// Drop the stack's reference to a connection that is gone.
    fn release(&mut self, conn: ConnectionHandle);
}
