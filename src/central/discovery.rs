use super::{
    Attribute, DiscoverKind, DiscoverRequest, SubscribeRequest, CCC_UUID, FIRST_ATTRIBUTE_HANDLE,
    LAST_ATTRIBUTE_HANDLE,
};

pub const CCC_NOTIFY: u16 = 0x0001;

/// The service and characteristic the walk is looking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GattTargets {
    pub service: u16,
    pub characteristic: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryPhase {
    Service,
    Characteristic,
    Descriptor { value_handle: u16 },
}

/// Position of the attribute walk on a single connection.
///
/// The cursor only moves forward: service, then characteristic, then the
/// configuration descriptor. Each step consumes the cursor so a stale one can
/// not be advanced twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryCursor {
    phase: DiscoveryPhase,
    start_handle: u16,
    end_handle: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Discover(DiscoveryCursor),
    Subscribe(SubscribeRequest),
    /// The next search range would start past the last handle.
    Exhausted,
}

impl Default for DiscoveryCursor {
    fn default() -> Self {
        Self::new()
    }
}

impl DiscoveryCursor {
    pub fn new() -> Self {
        DiscoveryCursor {
            phase: DiscoveryPhase::Service,
            start_handle: FIRST_ATTRIBUTE_HANDLE,
            end_handle: LAST_ATTRIBUTE_HANDLE,
        }
    }

    pub fn phase(&self) -> DiscoveryPhase {
        self.phase
    }

    pub fn range(&self) -> (u16, u16) {
        (self.start_handle, self.end_handle)
    }

    pub fn request(&self, targets: &GattTargets) -> DiscoverRequest {
        let (kind, uuid) = match self.phase {
            DiscoveryPhase::Service => (DiscoverKind::Primary, targets.service),
            DiscoveryPhase::Characteristic => {
                (DiscoverKind::Characteristic, targets.characteristic)
            }
            DiscoveryPhase::Descriptor { .. } => (DiscoverKind::Descriptor, CCC_UUID),
        };
        DiscoverRequest {
            kind,
            uuid,
            start_handle: self.start_handle,
            end_handle: self.end_handle,
        }
    }

    /// Feed the attribute matched by the current phase.
    pub fn advance(self, attr: Attribute) -> Step {
        let next = |phase, offset: u16| match attr.handle.checked_add(offset) {
            Some(start_handle) => Step::Discover(DiscoveryCursor {
                phase,
                start_handle,
                end_handle: self.end_handle,
            }),
            None => Step::Exhausted,
        };

        match self.phase {
            DiscoveryPhase::Service => next(DiscoveryPhase::Characteristic, 1),
            DiscoveryPhase::Characteristic => match attr.handle.checked_add(1) {
                Some(value_handle) => next(DiscoveryPhase::Descriptor { value_handle }, 2),
                None => Step::Exhausted,
            },
            DiscoveryPhase::Descriptor { value_handle } => Step::Subscribe(SubscribeRequest {
                value_handle,
                ccc_handle: attr.handle,
                value: CCC_NOTIFY,
            }),
        }
    }
}
