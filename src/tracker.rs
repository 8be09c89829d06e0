use crate::protocol::Packet;

/// Observer maintaining a latest-protocol mirror of the session's world
/// state. The relay feeds it every server-originated packet, upgraded to
/// the latest revision when the downstream speaks an older one, so the
/// mirror is always in latest-revision terms regardless of what the client
/// receives on the wire.
pub trait Tracker: Send {
    fn handle_packet(&mut self, pk: &dyn Packet);

    /// Called after the session moves to a new downstream; the new server
    /// restarts world state, so the mirror restarts with it.
    fn reset(&mut self);
}

/// Tracker that mirrors nothing.
pub struct NopTracker;

impl Tracker for NopTracker {
    fn handle_packet(&mut self, _pk: &dyn Packet) {}

    fn reset(&mut self) {}
}
