use super::{ConnectionHandle, DiscoverRequest, GattStack, StackError, SubscribeRequest};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    StartScan,
    StopScan,
    Connect(String),
    Discover(ConnectionHandle, DiscoverRequest),
    Subscribe(ConnectionHandle, SubscribeRequest),
    Release(ConnectionHandle),
}

/// Records every request and fails the ones it is told to.
#[derive(Debug, Default)]
pub struct MockStack {
    pub calls: Vec<Call>,
    pub next_conn: u32,
    pub fail_start_scan: bool,
    pub fail_stop_scan: bool,
    pub fail_connect: bool,
    pub fail_discover: bool,
    pub already_subscribed: bool,
    pub fail_subscribe: bool,
}

impl MockStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, call: &Call) -> usize {
        self.calls.iter().filter(|x| *x == call).count()
    }

    pub fn last_discover(&self) -> Option<DiscoverRequest> {
        self.calls.iter().rev().find_map(|x| match x {
            Call::Discover(_, req) => Some(*req),
            _ => None,
        })
    }
}

impl GattStack for MockStack {
    fn start_scan(&mut self) -> Result<(), StackError> {
        self.calls.push(Call::StartScan);
        if self.fail_start_scan {
            return Err(StackError::Other("scan refused".to_string()));
        }
        Ok(())
    }

    fn stop_scan(&mut self) -> Result<(), StackError> {
        self.calls.push(Call::StopScan);
        if self.fail_stop_scan {
            return Err(StackError::NotScanning);
        }
        Ok(())
    }

    fn connect(&mut self, address: &str) -> Result<ConnectionHandle, StackError> {
        self.calls.push(Call::Connect(address.to_string()));
        if self.fail_connect {
            return Err(StackError::InvalidAddress(address.to_string()));
        }
        self.next_conn += 1;
        Ok(ConnectionHandle(self.next_conn))
    }

    fn discover(
        &mut self,
        conn: ConnectionHandle,
        request: DiscoverRequest,
    ) -> Result<(), StackError> {
        self.calls.push(Call::Discover(conn, request));
        if self.fail_discover {
            return Err(StackError::Other("discover refused".to_string()));
        }
        Ok(())
    }

    fn subscribe(
        &mut self,
        conn: ConnectionHandle,
        request: SubscribeRequest,
    ) -> Result<(), StackError> {
        self.calls.push(Call::Subscribe(conn, request));
        if self.already_subscribed {
            return Err(StackError::AlreadySubscribed);
        }
        if self.fail_subscribe {
            return Err(StackError::UnknownAttribute(request.value_handle));
        }
        Ok(())
    }

    fn release(&mut self, conn: ConnectionHandle) {
        self.calls.push(Call::Release(conn));
    }
}
