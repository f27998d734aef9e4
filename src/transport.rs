//! Transport and client interfaces consumed by the shim.
//!
//! A function-pointer swap at registration time would get the same effect
//! with more indirection; the shim instead owns a `Box<dyn Transport>` and
//! a `Box<dyn Client>` directly, and is itself the single thing either side
//! calls into.

/// The transport capability set the shim depends on; everything else
/// about the transport is out of scope.
pub trait Transport: Send + Sync {
    /// Send one wire-message, already within the transport's own size
    /// limit. Returns the transport's receipt, or `0` if the send was
    /// refused (friend offline, queue full, ...).
    fn send_message(&self, friend: u32, msg_type: i32, bytes: &[u8]) -> u32;

    /// Whether `friend` currently has an active connection.
    fn is_friend_online(&self, friend: u32) -> bool;
}

/// The client application's callbacks; the application itself is out of
/// scope, specified only by the interface it provides here.
pub trait Client: Send + Sync {
    /// A complete message is ready: either a pass-through delivery or a
    /// fully reassembled one.
    fn on_message(&self, friend: u32, msg_type: i32, bytes: &[u8]);

    /// A previously issued receipt (transport's own, or one the shim
    /// allocated) has fired.
    fn on_receipt(&self, friend: u32, receipt: u32);
}

impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    fn send_message(&self, friend: u32, msg_type: i32, bytes: &[u8]) -> u32 {
        (**self).send_message(friend, msg_type, bytes)
    }

    fn is_friend_online(&self, friend: u32) -> bool {
        (**self).is_friend_online(friend)
    }
}

impl<T: Client + ?Sized> Client for std::sync::Arc<T> {
    fn on_message(&self, friend: u32, msg_type: i32, bytes: &[u8]) {
        (**self).on_message(friend, msg_type, bytes);
    }

    fn on_receipt(&self, friend: u32, receipt: u32) {
        (**self).on_receipt(friend, receipt);
    }
}
