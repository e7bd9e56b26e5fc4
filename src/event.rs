use crate::model::Bar;

/// Lifecycle of a single streaming connection, published on a watch channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    Idle,
    Connecting { generation: u64 },
    Open { generation: u64 },
    Reconnecting { attempt: u32, delay_ms: u64 },
    /// Gave up after too many consecutive failures. Needs a fresh subscribe.
    Failed { attempts: u32 },
    Closed,
}

impl ConnectionStatus {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed { .. } | Self::Closed)
    }
}

/// Output of live bar aggregation.
#[derive(Debug, Clone, PartialEq)]
pub enum BarEvent {
    /// Current state of the bar still being built.
    Update(Bar),
    /// Bar whose bucket has ended.
    Closed(Bar),
}

impl BarEvent {
    pub fn bar(&self) -> &Bar {
        match self {
            Self::Update(bar) | Self::Closed(bar) => bar,
        }
    }
}
