//! Actions served by a standalone node.

use hypercube_core::{HandlerModule, Result};
use serde_json::json;

/// `echo` returns its payload; `ping` answers with the node's identity.
pub fn node_handlers() -> Result<HandlerModule> {
    HandlerModule::new()
        .route("echo", |req| async move { Ok(req.payload().clone()) })?
        .route("ping", |req| async move {
            let local = req.link().local().clone();
            Ok(json!({
                "pong": true,
                "server": local.key(),
                "from": req.origin(),
            }))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use hypercube_core::Dispatch;

    #[test]
    fn test_node_serves_echo_and_ping() {
        let handlers = node_handlers().unwrap();
        assert!(handlers.handles("echo"));
        assert!(handlers.handles("ping"));
        assert!(!handlers.handles("_serverinfo"));
    }
}
