use std::{
    collections::HashMap,
    time::Duration,
};

use anyhow::{anyhow, bail, Context, Result};
use bluer::{
    gatt::remote::Characteristic, Adapter, AdapterEvent, Address, AddressType, Device,
    DeviceEvent, DeviceProperty, Session,
};
use futures::{pin_mut, Stream, StreamExt};
use log::{debug, error, info, warn};
use tokio::{
    sync::mpsc::UnboundedSender,
    task::JoinHandle,
    time::{sleep, Instant},
};
use uuid::Uuid;

use super::{
    Advertisement, Attribute, ConnectionHandle, DiscoverKind, DiscoverRequest, GattStack,
    StackError, StackEvent, SubscribeRequest,
};

/// `0000xxxx-0000-1000-8000-00805f9b34fb`
const BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5f9b_34fb;
const SERVICES_RESOLVE_TIMEOUT: Duration = Duration::from_secs(10);

pub fn bluetooth_uuid(short: u16) -> Uuid {
    Uuid::from_u128(BASE_UUID | ((short as u128) << 96))
}

/// Notification streams by value handle. A stream that ended no longer
/// counts as a subscription.
#[derive(Default)]
struct Subscriptions(HashMap<u16, JoinHandle<()>>);

impl Subscriptions {
    fn is_active(&mut self, value_handle: u16) -> bool {
        self.0.retain(|_, x| !x.is_finished());
        self.0.contains_key(&value_handle)
    }

    fn insert(&mut self, value_handle: u16, task: JoinHandle<()>) {
        self.0.insert(value_handle, task);
    }

    fn abort(&self) {
        self.0.values().for_each(JoinHandle::abort);
    }
}

struct Connection {
    device: Device,
    tasks: Vec<JoinHandle<()>>,
    subscriptions: Subscriptions,
}

impl Connection {
    fn spawn<F>(&mut self, f: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.tasks.retain(|x| !x.is_finished());
        self.tasks.push(tokio::spawn(f));
    }

    fn abort(&self) {
        self.tasks.iter().for_each(JoinHandle::abort);
        self.subscriptions.abort();
    }
}

/// [`GattStack`] on top of BlueZ.
///
/// Every request spawns a task which reports back through the event channel.
/// Attribute handles are the object ids BlueZ assigns, which are the handles
/// of the remote attribute table.
pub struct BluezStack {
    _session: Session,
    adapter: Adapter,
    events: UnboundedSender<StackEvent>,
    scan: Option<JoinHandle<()>>,
    connections: HashMap<ConnectionHandle, Connection>,
    next_handle: u32,
}

impl BluezStack {
    pub async fn new(events: UnboundedSender<StackEvent>) -> Result<Self> {
        let session = Session::new()
            .await
            .context("failed to connect to bluetoothd")?;
        let adapter = session.default_adapter().await?;
        adapter.set_powered(true).await?;

        info!(
            "bluetooth initialized on adapter `{}` with address `{}`",
            adapter.name(),
            adapter.address().await?
        );

        Ok(BluezStack {
            _session: session,
            adapter,
            events,
            scan: None,
            connections: HashMap::new(),
            next_handle: 0,
        })
    }

    fn connection(&mut self, conn: ConnectionHandle) -> Result<&mut Connection, StackError> {
        self.connections
            .get_mut(&conn)
            .ok_or(StackError::NotConnected(conn))
    }
}

impl Drop for BluezStack {
    fn drop(&mut self) {
        if let Some(x) = self.scan.take() {
            x.abort();
        }
        for (_, conn) in self.connections.drain() {
            conn.abort();
        }
    }
}

impl GattStack for BluezStack {
    fn start_scan(&mut self) -> Result<(), StackError> {
        if self.scan.as_ref().map_or(false, |x| !x.is_finished()) {
            debug!("scan already running");
            return Ok(());
        }

        let adapter = self.adapter.clone();
        let events = self.events.clone();
        self.scan = Some(tokio::spawn(async move {
            loop {
                match scan(&adapter, &events).await {
                    Ok(()) => break,
                    Err(e) => {
                        error!("bluetooth discovery failed: {e}");
                        sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }));
        Ok(())
    }

    fn stop_scan(&mut self) -> Result<(), StackError> {
        match self.scan.take() {
            Some(x) => {
                x.abort();
                Ok(())
            }
            None => Err(StackError::NotScanning),
        }
    }

    fn connect(&mut self, address: &str) -> Result<ConnectionHandle, StackError> {
        let addr: Address = address
            .split(' ')
            .next()
            .and_then(|x| x.parse().ok())
            .ok_or_else(|| StackError::InvalidAddress(address.to_string()))?;
        let device = self.adapter.device(addr)?;

        self.next_handle = self.next_handle.wrapping_add(1);
        let conn = ConnectionHandle(self.next_handle);

        let mut entry = Connection {
            device: device.clone(),
            tasks: Vec::new(),
            subscriptions: Subscriptions::default(),
        };
        let events = self.events.clone();
        entry.spawn(async move {
            // Listen before connecting so a drop right after the link comes up
            // is not missed.
            let changes = match device.events().await {
                Ok(x) => x,
                Err(e) => {
                    let status = Err(StackError::from(e));
                    events.send(StackEvent::Connected { conn, status }).ok();
                    return;
                }
            };
            let status = connect_device(&device).await;
            let failed = status.is_err();
            let status = status.map_err(StackError::from);
            if events.send(StackEvent::Connected { conn, status }).is_err() || failed {
                return;
            }
            let reason = match device.is_connected().await {
                Ok(connected) => link_lost(connected, changes).await.to_string(),
                Err(e) => format!("{e}"),
            };
            events.send(StackEvent::Disconnected { conn, reason }).ok();
        });
        self.connections.insert(conn, entry);

        Ok(conn)
    }

    fn discover(
        &mut self,
        conn: ConnectionHandle,
        request: DiscoverRequest,
    ) -> Result<(), StackError> {
        let events = self.events.clone();
        let entry = self.connection(conn)?;
        let device = entry.device.clone();
        entry.spawn(async move {
            let attribute = match find_attribute(&device, request).await {
                Ok(x) => x,
                Err(e) => {
                    error!("attribute discovery failed: {e:#}");
                    None
                }
            };
            events.send(StackEvent::Discovered { conn, attribute }).ok();
        });
        Ok(())
    }

    fn subscribe(
        &mut self,
        conn: ConnectionHandle,
        request: SubscribeRequest,
    ) -> Result<(), StackError> {
        let events = self.events.clone();
        let decl_handle = request
            .value_handle
            .checked_sub(1)
            .ok_or(StackError::UnknownAttribute(request.value_handle))?;
        let entry = self.connection(conn)?;
        if entry.subscriptions.is_active(request.value_handle) {
            return Err(StackError::AlreadySubscribed);
        }

        let device = entry.device.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = forward_notifications(&device, conn, decl_handle, request, &events).await
            {
                error!("notification stream failed: {e:#}");
            }
            events
                .send(StackEvent::Notification {
                    conn,
                    value_handle: request.value_handle,
                    data: None,
                })
                .ok();
        });
        entry.subscriptions.insert(request.value_handle, task);
        Ok(())
    }

    fn release(&mut self, conn: ConnectionHandle) {
        if let Some(entry) = self.connections.remove(&conn) {
            entry.abort();
        }
    }
}

async fn scan(adapter: &Adapter, events: &UnboundedSender<StackEvent>) -> Result<()> {
    let discover = adapter.discover_devices().await?;
    pin_mut!(discover);

    while let Some(evt) = discover.next().await {
        match evt {
            AdapterEvent::DeviceAdded(addr) => {
                let device = adapter.device(addr)?;
                match advertisement(&device).await {
                    Ok(adv) => {
                        if events.send(StackEvent::Advertisement(adv)).is_err() {
                            return Ok(());
                        }
                    }
                    Err(e) => debug!("could not read advertisement of {addr}: {e}"),
                }
            }
            AdapterEvent::DeviceRemoved(addr) => {
                debug!("device removed {addr}")
            }
            _ => {}
        }
    }
    bail!("discovery quit")
}

async fn advertisement(device: &Device) -> bluer::Result<Advertisement> {
    let kind = match device.address_type().await? {
        AddressType::LePublic => "public",
        AddressType::LeRandom => "random",
        _ => "br/edr",
    };
    let rssi = device.rssi().await?.unwrap_or(0);

    let mut data = Vec::new();
    let mut md: Vec<_> = device
        .manufacturer_data()
        .await?
        .unwrap_or_default()
        .into_iter()
        .collect();
    md.sort_by_key(|x| x.0);
    for (id, value) in md {
        // length covers the type byte and the company id
        let len = (value.len() + 3).min(u8::MAX as usize);
        data.push(len as u8);
        data.push(0xff);
        data.extend_from_slice(&id.to_le_bytes());
        data.extend_from_slice(&value[..len - 3]);
    }

    Ok(Advertisement {
        address: format!("{} ({})", device.address(), kind),
        rssi,
        data,
    })
}

async fn connect_device(device: &Device) -> bluer::Result<()> {
    if device.is_connected().await? {
        info!("already connected to bluetooth device {}", device.address());
        return Ok(());
    }
    device.connect().await
}

/// Resolves once the link is gone.
///
/// `changes` has to be opened before connecting, `connected` read after.
async fn link_lost<S>(connected: bool, changes: S) -> &'static str
where
    S: Stream<Item = DeviceEvent>,
{
    if !connected {
        return "link lost";
    }
    pin_mut!(changes);

    while let Some(evt) = changes.next().await {
        if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) = evt {
            return "link lost";
        }
    }
    "device removed"
}

async fn wait_services_resolved(device: &Device) -> Result<()> {
    let deadline = Instant::now() + SERVICES_RESOLVE_TIMEOUT;
    while !device.is_services_resolved().await? {
        if Instant::now() >= deadline {
            bail!("services of {} were not resolved in time", device.address());
        }
        sleep(Duration::from_millis(100)).await;
    }
    Ok(())
}

fn keep_lowest(found: &mut Option<u16>, id: u16) {
    if found.map_or(true, |x| id < x) {
        *found = Some(id);
    }
}

async fn find_attribute(device: &Device, req: DiscoverRequest) -> Result<Option<Attribute>> {
    wait_services_resolved(device).await?;

    let uuid = bluetooth_uuid(req.uuid);
    let in_range = |id: u16| id >= req.start_handle && id <= req.end_handle;
    let mut found = None;

    for service in device.services().await? {
        match req.kind {
            DiscoverKind::Primary => {
                if in_range(service.id())
                    && service.primary().await?
                    && service.uuid().await? == uuid
                {
                    keep_lowest(&mut found, service.id());
                }
            }
            DiscoverKind::Characteristic => {
                for chari in service.characteristics().await? {
                    if in_range(chari.id()) && chari.uuid().await? == uuid {
                        keep_lowest(&mut found, chari.id());
                    }
                }
            }
            DiscoverKind::Descriptor => {
                for chari in service.characteristics().await? {
                    for desc in chari.descriptors().await? {
                        if in_range(desc.id()) && desc.uuid().await? == uuid {
                            keep_lowest(&mut found, desc.id());
                        }
                    }
                }
            }
        }
    }

    Ok(found.map(|handle| Attribute {
        handle,
        uuid: req.uuid,
    }))
}

async fn find_characteristic(device: &Device, handle: u16) -> Result<Characteristic> {
    for service in device.services().await? {
        for chari in service.characteristics().await? {
            if chari.id() == handle {
                return Ok(chari);
            }
        }
    }
    Err(anyhow!(StackError::UnknownAttribute(handle)))
}

async fn forward_notifications(
    device: &Device,
    conn: ConnectionHandle,
    decl_handle: u16,
    request: SubscribeRequest,
    events: &UnboundedSender<StackEvent>,
) -> Result<()> {
    let chari = find_characteristic(device, decl_handle).await?;
    debug!(
        "enabling notifications on {:#06x} through descriptor {:#06x} (value {:#06x})",
        request.value_handle, request.ccc_handle, request.value
    );
    let notify = chari
        .notify()
        .await
        .context("failed to enable notifications")?;
    pin_mut!(notify);

    while let Some(data) = notify.next().await {
        let event = StackEvent::Notification {
            conn,
            value_handle: request.value_handle,
            data: Some(data),
        };
        if events.send(event).is_err() {
            warn!("central session quit, dropping notification stream");
            break;
        }
    }
    Ok(())
}
