// Realtime subscriptions: shared transport channels, event deduplication
// and resync after disconnects.

pub mod manager;
pub mod timeline;
pub mod transport;
pub mod window;

#[cfg(test)]
mod tests;

pub use manager::{
    ChannelInfo, RealtimeChannelManager, RealtimeNotice, Subscription, SubscriptionHandle,
};
pub use timeline::MessageTimeline;
pub use transport::{
    ChangeEvent, ChangeKind, RealtimeTransport, ResourceId, TransportChannel, TransportMessage,
};
pub use window::SeenWindow;
