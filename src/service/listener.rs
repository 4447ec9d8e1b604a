use std::{net::SocketAddr, sync::Arc};

use crate::{errors::ListenerResult, session::Session};

// -----------------------------------------------------------------------------
// ----- ServiceListener -------------------------------------------------------

/// Lifecycle callbacks for one service.
///
/// `activated` and `deactivated` run while the bound-address lock is held so
/// the edges they report can never be reordered. They must not call back into
/// `bind` or `unbind` on the same service.
pub trait ServiceListener: Send + Sync + 'static {
    /// The first address was bound.
    fn activated(&self, _service: &str, _first: SocketAddr) -> ListenerResult {
        Ok(())
    }

    /// The last address was unbound.
    fn deactivated(&self, _service: &str, _last: SocketAddr) -> ListenerResult {
        Ok(())
    }

    fn session_created(&self, _session: &Arc<Session>) -> ListenerResult {
        Ok(())
    }

    fn session_destroyed(&self, _session: &Arc<Session>) -> ListenerResult {
        Ok(())
    }
}
